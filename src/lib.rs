pub mod config;
pub mod db;
pub mod dtos;
pub mod error;
pub mod handler;
pub mod models;
pub mod service;
