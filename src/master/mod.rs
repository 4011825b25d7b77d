//! Master side: key acceptance, publication, return collection and access
//! control.

pub mod acl;
pub mod api;
pub mod dispatch;
pub mod job;
pub mod job_cache;
pub mod server;
pub mod target;
pub mod token;

pub use acl::{ClientAcl, Decision, DenyReason, PeerAcl};
pub use dispatch::{Dispatcher, MinionRegistry, PublishRequest, PublishResult};
pub use job::{valid_jid, Job, JidGenerator, JobReturn};
pub use job_cache::{CacheMiss, FsJobStore, JobCache, JobStore, MemoryJobStore, ReturnOutcome};
pub use server::Master;
pub use target::{Grains, Target, TargetType};
pub use token::{AuthToken, Authenticator, StaticCredentials, TokenCheck, TokenStore};
