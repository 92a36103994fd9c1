pub mod event;
pub mod run;
pub mod step;
pub mod story;

pub use event::*;
pub use run::*;
pub use step::*;
pub use story::*;
