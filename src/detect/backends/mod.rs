pub mod scripted;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use scripted::ScriptedEngine;

#[cfg(feature = "backend-tract")]
pub use tract::TractEngine;
