// src/module/mod.rs

pub mod config;
pub mod skeleton;

pub use config::ModuleConfig;
pub use skeleton::{CommandInfo, Module, ModuleContext, ModuleHandle};
