//! ---
//! vfab_section: "01-fleet-runtime"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Fleet supervision and lifecycle management."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---

pub mod supervisor;

pub use supervisor::{FleetCollaborators, FleetHandle, FleetSupervisor};
