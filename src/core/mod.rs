pub mod downloader;
pub mod events;
pub mod fsops;
pub mod installer;
pub mod model;
pub mod orchestrator;
