//! ---
//! vfab_section: "04-escalation-policy"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Queue-driven escalation engine."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---

pub mod engine;

pub use engine::{EscalationEngine, EscalationHandle};
