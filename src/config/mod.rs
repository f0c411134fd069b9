pub mod guild;

pub use guild::{GuildConfig, GuildDirectory};
