//! HTTP route handlers

pub mod detections;
pub mod views;
