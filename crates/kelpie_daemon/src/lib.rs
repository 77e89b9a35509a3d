//! Process-wide daemon subsystems.
//!
//! The centerpiece is the external authentication manager: a single worker
//! thread that multiplexes authentication and authorization requests from
//! many client connections onto one designated provider connection, pushes
//! the active-user list on a timer, and fails pending work cleanly when the
//! provider goes away. Around it sit the connection/worker-thread model it
//! delivers frames through, the process-wide RBAC cache it keeps warm, and
//! the settings that tune it.

pub mod auth;
pub mod connection;
pub mod rbac;
pub mod settings;
