//! lxbake CLI - build LXD images and manage them as named resources.

pub mod commands;
pub mod output;
pub mod state;
