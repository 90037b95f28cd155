//! Custom Resource Definitions for the VIRTA controller
//!
//! - `Rollout` — the declarative progressive-delivery unit
//! - `AnalysisTemplate` / `AnalysisRun` — metric-based promotion gates
//! - `Experiment` — short-lived sibling workloads gating canary steps

pub mod analysis;
pub mod experiment;
pub mod rollout;
