// ==============================================================================
// lib.rs - Metabolomics Analysis Pipeline Library
// ==============================================================================
// Description: Library interface for metabolomics analysis task modules
// Created: 2026-02-10
// Modified: 2026-08-30
// Version: 1.0.0
// ==============================================================================

pub mod cache;
pub mod correction;
pub mod dataset;
pub mod errors;
pub mod models;
pub mod reconcile;
pub mod registry;
pub mod script;
pub mod table;
pub mod task;
