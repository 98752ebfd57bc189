pub mod asset;
pub mod contract;
pub mod profile;
pub mod recommendation;
