pub mod access;
pub mod audit;
pub mod common;
pub mod db;
pub mod decision;
pub mod gate;
pub mod git;
pub mod identity;
pub mod proposal;
pub mod registry;
pub mod sync;
pub mod thread;

pub mod prelude {
    //! Commonly used types.
    pub use crate::access::{Resource, Role};
    pub use crate::common::Timestamp;
    pub use crate::db::Database;
    pub use crate::identity::User;
}

pub use db::Database;
