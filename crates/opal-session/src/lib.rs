//! OpalDB persistence session.
//!
//! The session layer drives the codec, cache, and ledger: it allocates
//! identities, materializes hollow instances, flushes modified objects at
//! commit, and restores pre-modification images on rollback. A session is
//! usable by one thread at a time.

pub mod session;

pub use session::MemSession;
