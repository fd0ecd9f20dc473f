//! Local HTTP dashboard for operators at the device.

mod handlers;
mod server;


pub use server::{router, DashboardServer, DashboardState};
