//! Storage: on-disk layout, settings and the database

pub mod db;
pub mod layout;
pub mod settings;
