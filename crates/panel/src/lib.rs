//! Core of the irrigation SMS control panel: command formatting, telemetry
//! normalization, nutrient aggregation and per-device dispatch control,
//! plus the persistence and HTTP layers the panel binary runs on.

pub mod api;
pub mod command;
pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod numeric;
pub mod nutrient;
pub mod registry;
pub mod sms;
pub mod state;
pub mod telemetry;
pub mod web;
