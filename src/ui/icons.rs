//! Shared UI icons and emojis.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static WARNING: Emoji<'_, '_> = Emoji("⚠️  ", "[!]");

// Workflow indicators
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static TOOL: Emoji<'_, '_> = Emoji("🔧 ", "-");
pub static AGENT: Emoji<'_, '_> = Emoji("💬 ", ">");
pub static COMMAND: Emoji<'_, '_> = Emoji("⚙️  ", "$");
pub static QUESTION: Emoji<'_, '_> = Emoji("❓ ", "[?]");
pub static BLOCKER: Emoji<'_, '_> = Emoji("🚧 ", "[BLOCK]");
pub static PIVOT: Emoji<'_, '_> = Emoji("🔄 ", "[HANDOFF]");
pub static PAUSED: Emoji<'_, '_> = Emoji("⏸️  ", "[||]");
