pub mod chain;
pub mod dedup;
pub mod extract;
pub mod filter;
pub mod image_ref;
pub mod patterns;
pub mod validator;

#[cfg(test)]
pub mod testing;

pub use chain::ScreenshotChain;
pub use dedup::{DedupReport, deduplicate_with_report};
pub use extract::PageExtractor;
pub use filter::{FilterOutcome, SmartFilter};
pub use patterns::{PatternAnalyzer, PatternReport};
pub use validator::{ScreenshotValidator, ValidationResult};
