//! ---
//! vfab_section: "03-device-reconciler"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Per-device poll/report/react reconciliation loop."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---

pub mod reconciler;
pub mod state;

pub use reconciler::{DeviceCollaborators, DeviceReconciler};
pub use state::DeviceShadowState;
