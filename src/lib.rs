pub mod agent;
pub mod analysis;
pub mod audio;
pub mod events;
pub mod frame;
pub mod media;
pub mod models;
pub mod monitor;
pub mod quota;
pub mod server;
pub mod session;
pub mod settings;
