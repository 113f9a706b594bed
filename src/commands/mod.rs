pub(crate) mod config;
pub(crate) mod internal;
pub(crate) mod logs;
pub(crate) mod supervisor;
