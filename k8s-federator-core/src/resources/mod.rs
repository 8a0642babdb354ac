pub mod annotations;
pub mod crd;
pub mod federation;
pub mod labels;
pub mod proxy;
