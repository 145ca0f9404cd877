pub mod money;
pub mod profile;
pub mod project;
pub mod request;
