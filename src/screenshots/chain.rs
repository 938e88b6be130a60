//! Retrying resolution: primary source first, then scraping the product page
//! with exponential backoff, then a best-effort fallback.
//!
//! ```text
//! TryPrimary --accepted--> Done
//! TryPrimary --rejected--> TryScrape(1)        (Fallback when max_retries == 0)
//! TryScrape(k) --accepted--> Done
//! TryScrape(k) --failed--> TryScrape(k + 1)    after backoff_base * 2^(k-1)
//! TryScrape(max) --failed--> Fallback --> Done
//! ```
//!
//! [`ScreenshotChain::resolve`] never fails; the worst case is three empty
//! collections carrying a warning and the last error.

use crate::config::{ChainConfig, ExtractionConfig, page_url};
use crate::http::WebClient;
use crate::pipeline::{PipelineError, PipelineErrorKind};
use crate::models::{
    AppRecord, AttemptOutcome, AttemptReport, ExtractionResult, Platform, PlatformCollections,
    ResolveOptions, ResultSource,
};
use crate::screenshots::dedup::deduplicate;
use crate::screenshots::extract::{Extraction, PageExtractor};
use crate::screenshots::filter::SmartFilter;
use crate::screenshots::validator::{ScreenshotValidator, ValidationResult};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MAX_RETRIES_LIMIT: u32 = 10;

const PAGE_HEADERS: &[(&str, &str)] = &[
    ("Accept", "text/html,application/xhtml+xml"),
    ("Accept-Language", "en-US,en;q=0.9"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    TryPrimary,
    TryScrape(u32),
    Fallback,
    Done,
}

impl ChainState {
    pub fn name(&self) -> &'static str {
        match self {
            ChainState::TryPrimary => "try_primary",
            ChainState::TryScrape(_) => "try_scrape",
            ChainState::Fallback => "fallback",
            ChainState::Done => "done",
        }
    }

    pub fn attempt(&self) -> u32 {
        match self {
            ChainState::TryScrape(k) => *k,
            _ => 0,
        }
    }

    /// Next state after running `self`.
    pub fn next(self, accepted: bool, max_retries: u32) -> ChainState {
        match (self, accepted) {
            (ChainState::TryPrimary | ChainState::TryScrape(_), true) => ChainState::Done,
            (ChainState::TryPrimary, false) if max_retries > 0 => ChainState::TryScrape(1),
            (ChainState::TryPrimary, false) => ChainState::Fallback,
            (ChainState::TryScrape(k), false) if k < max_retries => ChainState::TryScrape(k + 1),
            (ChainState::TryScrape(_), false) => ChainState::Fallback,
            (ChainState::Fallback | ChainState::Done, _) => ChainState::Done,
        }
    }
}

/// Wait inserted after scrape attempt `attempt` fails.
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

/// What one state produced.
enum Step {
    Accepted {
        collections: PlatformCollections,
        validation: Option<ValidationResult>,
        candidates: usize,
    },
    Skipped,
    NoCandidates {
        error: PipelineError,
    },
    Rejected {
        raw: PlatformCollections,
        validation: ValidationResult,
        candidates: usize,
    },
    Failed {
        error: PipelineError,
    },
}

impl Step {
    fn outcome(&self) -> AttemptOutcome {
        match self {
            Step::Accepted { .. } => AttemptOutcome::Accepted,
            Step::Skipped => AttemptOutcome::Skipped,
            Step::NoCandidates { .. } => AttemptOutcome::NoCandidates,
            Step::Rejected { .. } => AttemptOutcome::Rejected,
            Step::Failed { .. } => AttemptOutcome::Failed,
        }
    }

    fn error(&self) -> Option<String> {
        match self {
            Step::NoCandidates { error } | Step::Failed { error } => Some(error.to_string()),
            Step::Rejected { validation, .. } => Some(
                PipelineError::new(
                    "validate",
                    PipelineErrorKind::ValidationFailure,
                    format!(
                        "confidence {:.2} below threshold (issues: {:?})",
                        validation.confidence, validation.issues
                    ),
                )
                .to_string(),
            ),
            _ => None,
        }
    }

    fn report(&self, state: ChainState, elapsed_ms: u128) -> AttemptReport {
        let mut report = AttemptReport::new(state.name(), state.attempt(), elapsed_ms, self.outcome());
        report.error = self.error();
        match self {
            Step::Accepted { candidates, validation, .. } => {
                report.candidates = *candidates;
                report.confidence = validation.as_ref().map(|v| v.confidence);
            }
            Step::Rejected { candidates, validation, .. } => {
                report.candidates = *candidates;
                report.confidence = Some(validation.confidence);
            }
            _ => {}
        }
        report
    }
}

/// Mutable bookkeeping for one `resolve` call.
struct Run {
    attempts: Vec<AttemptReport>,
    best_raw: Option<PlatformCollections>,
    last_error: Option<String>,
}

impl Run {
    /// Larger totals win; ties keep the earlier (primary) data.
    fn offer_raw(&mut self, raw: PlatformCollections) {
        let better = self
            .best_raw
            .as_ref()
            .is_none_or(|current| raw.total() > current.total());
        if better {
            self.best_raw = Some(raw);
        }
    }
}

pub struct ScreenshotChain {
    web: Arc<dyn WebClient>,
    validator: Arc<ScreenshotValidator>,
    filter: SmartFilter,
    extractor: PageExtractor,
    config: ChainConfig,
}

impl ScreenshotChain {
    pub fn new(
        web: Arc<dyn WebClient>,
        validator: Arc<ScreenshotValidator>,
        filter: SmartFilter,
        extractor: PageExtractor,
        config: ChainConfig,
    ) -> Self {
        Self {
            web,
            validator,
            filter,
            extractor,
            config,
        }
    }

    fn extraction_config(&self) -> &ExtractionConfig {
        self.extractor.config()
    }

    /// Deduplicate then filter every platform.
    pub fn refine(&self, raw: &PlatformCollections) -> PlatformCollections {
        let mut out = PlatformCollections::default();
        for platform in Platform::ALL {
            let unique = deduplicate(raw.get(platform), platform);
            out.set(platform, self.filter.filter(&unique, platform));
        }
        out
    }

    pub async fn resolve(
        &self,
        record: &AppRecord,
        subject_id: &str,
        country: &str,
        options: ResolveOptions,
    ) -> ExtractionResult {
        let resolution_id = Uuid::new_v4().to_string();
        let max_retries = options.max_retries.min(MAX_RETRIES_LIMIT);
        let mut run = Run {
            attempts: Vec::new(),
            best_raw: None,
            last_error: None,
        };

        if options.force_refresh {
            self.validator.cache().remove(subject_id, country).await;
        }

        let mut state = ChainState::TryPrimary;
        loop {
            let step = match state {
                ChainState::Fallback | ChainState::Done => break,
                ChainState::TryPrimary => {
                    self.capture_attempt(state, &mut run, self.try_primary(record, subject_id, country, options))
                        .await
                }
                ChainState::TryScrape(k) => {
                    if k > 1 {
                        let wait = backoff(self.config.backoff_base, k - 1);
                        debug!(target = "argus.chain", %resolution_id, attempt = k, wait_ms = wait.as_millis() as u64, "scrape_backoff");
                        sleep(wait).await;
                    }
                    self.capture_attempt(state, &mut run, self.try_scrape(subject_id, country, options))
                        .await
                }
            };

            if let Some(error) = step.error() {
                run.last_error = Some(error);
            }
            match step {
                Step::Accepted {
                    collections,
                    validation,
                    ..
                } => {
                    let source = if state == ChainState::TryPrimary {
                        ResultSource::Primary
                    } else {
                        ResultSource::Scrape
                    };
                    info!(
                        target = "argus.chain",
                        %resolution_id,
                        subject_id = %subject_id,
                        country = %country,
                        source = ?source,
                        total = collections.total(),
                        "screenshots_resolved"
                    );
                    let mut result = ExtractionResult::new(resolution_id, collections, source);
                    result.validation = validation;
                    result.attempts = run.attempts;
                    return result;
                }
                Step::Rejected { raw, .. } => {
                    // A rejected verdict must not answer for the next candidate.
                    self.validator.cache().remove(subject_id, country).await;
                    run.offer_raw(raw);
                }
                Step::Failed { .. } | Step::NoCandidates { .. } | Step::Skipped => {}
            }
            state = state.next(false, max_retries);
        }

        self.fallback(run, resolution_id, subject_id, country)
    }

    async fn capture_attempt<Fut>(&self, state: ChainState, run: &mut Run, fut: Fut) -> Step
    where
        Fut: Future<Output = Step>,
    {
        let started = Instant::now();
        let step = fut.await;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::attempt_elapsed(state.name(), state.attempt(), elapsed_ms);
        let report = step.report(state, elapsed_ms);
        if let Some(error) = &report.error {
            debug!(target = "argus.chain", state = state.name(), attempt = state.attempt(), error = %error, "attempt_unsuccessful");
        }
        run.attempts.push(report);
        step
    }

    async fn try_primary(
        &self,
        record: &AppRecord,
        subject_id: &str,
        country: &str,
        options: ResolveOptions,
    ) -> Step {
        if options.force_refresh {
            return Step::Skipped;
        }
        let raw = record.collections();
        if raw.is_empty() {
            return Step::NoCandidates {
                error: PipelineError::new(
                    "try_primary",
                    PipelineErrorKind::NotFound,
                    "primary source supplied no screenshots",
                ),
            };
        }
        let candidates = raw.total();
        let validation = if options.skip_validation {
            None
        } else {
            let result = self.validator.validate(&raw, subject_id, country).await;
            if result.confidence < self.config.min_confidence {
                return Step::Rejected {
                    raw,
                    validation: result,
                    candidates,
                };
            }
            Some(result)
        };
        Step::Accepted {
            collections: self.refine(&raw),
            validation,
            candidates,
        }
    }

    async fn try_scrape(&self, subject_id: &str, country: &str, options: ResolveOptions) -> Step {
        let extraction = match self.scrape(subject_id, country).await {
            Ok(extraction) => extraction,
            Err(error) => return Step::Failed { error },
        };
        if extraction.is_empty() {
            let mut reason = format!(
                "no screenshot candidates on product page ({} image urls harvested)",
                extraction.harvested
            );
            if let Some(rejection) = &extraction.tablet_rejection {
                reason.push_str(&format!("; {rejection}"));
            }
            return Step::NoCandidates {
                error: PipelineError::new("extract", PipelineErrorKind::ParseFailure, reason),
            };
        }

        let candidates = extraction.collections.total();
        let refined = self.refine(&extraction.collections);
        let validation = if options.skip_validation {
            None
        } else {
            let result = self.validator.validate(&refined, subject_id, country).await;
            if result.confidence < self.config.min_confidence {
                return Step::Rejected {
                    raw: extraction.collections,
                    validation: result,
                    candidates,
                };
            }
            Some(result)
        };
        Step::Accepted {
            collections: refined,
            validation,
            candidates,
        }
    }

    async fn scrape(&self, subject_id: &str, country: &str) -> Result<Extraction, PipelineError> {
        let config = self.extraction_config();
        let url = page_url(&config.page_url_template, subject_id, country);
        let markup = self
            .web
            .fetch_page(&url, PAGE_HEADERS, config.page_timeout)
            .await
            .map_err(|err| PipelineError::from_fetch("scrape", err))?;
        Ok(self.extractor.extract(&markup))
    }

    fn fallback(
        &self,
        mut run: Run,
        resolution_id: String,
        subject_id: &str,
        country: &str,
    ) -> ExtractionResult {
        let started = Instant::now();
        let raw = run.best_raw.take().unwrap_or_default();
        let collections = self.refine(&raw);
        let elapsed_ms = started.elapsed().as_millis();

        let mut report = AttemptReport::new(
            ChainState::Fallback.name(),
            0,
            elapsed_ms,
            if collections.is_empty() {
                AttemptOutcome::NoCandidates
            } else {
                AttemptOutcome::Accepted
            },
        );
        report.candidates = raw.total();
        run.attempts.push(report);

        let warning = if collections.is_empty() {
            "no screenshot source produced usable results; returning empty collections".to_string()
        } else {
            "no screenshot source passed validation; returning best available unvalidated data"
                .to_string()
        };
        warn!(
            target = "argus.chain",
            %resolution_id,
            subject_id = %subject_id,
            country = %country,
            total = collections.total(),
            last_error = ?run.last_error,
            "screenshot_fallback"
        );

        let mut result = ExtractionResult::new(resolution_id, collections, ResultSource::Fallback);
        result.warning = Some(warning);
        result.error = run.last_error;
        result.attempts = run.attempts;
        result
    }

    /// Fills only the platforms the primary record lacks from one scrape pass.
    /// A scrape failure returns the record unchanged.
    pub async fn fill_missing(&self, record: &AppRecord, subject_id: &str, country: &str) -> AppRecord {
        let missing: Vec<Platform> = Platform::ALL
            .into_iter()
            .filter(|p| !record.has_platform(*p))
            .collect();
        if missing.is_empty() {
            return record.clone();
        }

        let extraction = match self.scrape(subject_id, country).await {
            Ok(extraction) => extraction,
            Err(error) => {
                warn!(target = "argus.chain", subject_id = %subject_id, country = %country, error = %error, "fill_missing_scrape_failed");
                return record.clone();
            }
        };

        let refined = self.refine(&extraction.collections);
        let mut merged = record.clone();
        for platform in missing {
            let urls = refined.get(platform);
            if !urls.is_empty() {
                merged.set_platform(platform, urls.to_vec());
            }
        }
        merged
    }
}
