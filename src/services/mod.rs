pub mod capability;
pub mod compatibility;
pub mod compositor;
pub mod job_manager;
pub mod media;
pub mod pipeline;
pub mod placement;
pub mod quality;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod scene_analyzer;
pub mod storage;
pub mod stylist;
pub mod vision;
