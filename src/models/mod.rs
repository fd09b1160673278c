pub mod asset;
pub mod composite;
pub mod job;
pub mod media;
pub mod placement;
pub mod quality;
pub mod requests;
pub mod scene;
