pub mod api;
pub mod chats;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod groups;
pub mod housekeeping;
pub mod matchqueue;
pub mod model;
pub mod moderation;
pub mod presence;
pub mod stats;
pub mod tickets;
