use crate::catalog::{AppSource, CatalogClient, CatalogError};
use crate::config::ResolverConfig;
use crate::http::{FetchError, HttpWebClient, WebClient};
use crate::models::{
    AppRecord, AppResolution, ExtractionResult, Platform, PlatformCollections, ResolveMode,
    ResolveOptions,
};
use crate::screenshots::chain::MAX_RETRIES_LIMIT;
use crate::screenshots::{
    DedupReport, FilterOutcome, PageExtractor, PatternAnalyzer, PatternReport, ScreenshotChain,
    ScreenshotValidator, SmartFilter, ValidationResult, deduplicate_with_report,
};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

const MAX_SUBJECT_ID_LEN: usize = 64;

#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<ResolverConfig>,
    analyzer: PatternAnalyzer,
    filter: SmartFilter,
    validator: Arc<ScreenshotValidator>,
    chain: Arc<ScreenshotChain>,
    source: Arc<dyn AppSource>,
}

impl Pipeline {
    pub fn new(
        config: ResolverConfig,
        web: Arc<dyn WebClient>,
        source: Arc<dyn AppSource>,
    ) -> Self {
        let validator = Arc::new(ScreenshotValidator::new(web.clone(), config.validator.clone()));
        let analyzer = PatternAnalyzer::new(config.limits);
        let filter = SmartFilter::new(analyzer.clone());
        let chain = ScreenshotChain::new(
            web,
            validator.clone(),
            filter.clone(),
            PageExtractor::new(config.extraction.clone(), config.limits),
            config.chain.clone(),
        );
        Self {
            config: Arc::new(config),
            analyzer,
            filter,
            validator,
            chain: Arc::new(chain),
            source,
        }
    }

    pub fn from_env() -> Self {
        let config = ResolverConfig::from_env();
        let web: Arc<dyn WebClient> = Arc::new(HttpWebClient::from_env());
        let source: Arc<dyn AppSource> = Arc::new(CatalogClient::from_env(&config.lookup_url));
        Self::new(config, web, source)
    }

    pub fn default_options(&self) -> ResolveOptions {
        ResolveOptions {
            max_retries: self.config.chain.default_max_retries,
            ..ResolveOptions::default()
        }
    }

    pub fn analyze(&self, urls: &[String], platform: &str) -> Result<PatternReport, PipelineError> {
        let platform = parse_platform("analyze", platform)?;
        self.check_urls("analyze", urls)?;
        Ok(self.analyzer.analyze(urls, platform))
    }

    pub fn deduplicate(&self, urls: &[String], platform: &str) -> Result<DedupReport, PipelineError> {
        let platform = parse_platform("deduplicate", platform)?;
        self.check_urls("deduplicate", urls)?;
        Ok(deduplicate_with_report(urls, platform))
    }

    pub fn filter(&self, urls: &[String], platform: &str) -> Result<FilterOutcome, PipelineError> {
        let platform = parse_platform("filter", platform)?;
        self.check_urls("filter", urls)?;
        Ok(self.filter.filter_with_report(urls, platform))
    }

    pub async fn validate(
        &self,
        collections: &PlatformCollections,
        subject_id: &str,
        country: &str,
    ) -> Result<ValidationResult, PipelineError> {
        let (subject_id, country) = check_subject("validate", subject_id, country)?;
        self.check_collections("validate", collections)?;
        Ok(self.validator.validate(collections, &subject_id, &country).await)
    }

    pub async fn resolve(
        &self,
        record: &AppRecord,
        subject_id: &str,
        country: &str,
        options: ResolveOptions,
    ) -> Result<ExtractionResult, PipelineError> {
        let (subject_id, country) = check_subject("resolve", subject_id, country)?;
        check_retries("resolve", options.max_retries)?;
        self.check_collections("resolve", &record.collections())?;
        Ok(self.run_chain(record, &subject_id, &country, options).await)
    }

    async fn run_chain(
        &self,
        record: &AppRecord,
        subject_id: &str,
        country: &str,
        options: ResolveOptions,
    ) -> ExtractionResult {
        let started = Instant::now();
        let result = self.chain.resolve(record, subject_id, country, options).await;
        info!(
            target = "argus.pipeline",
            resolution_id = %result.resolution_id,
            subject_id = %subject_id,
            country = %country,
            source = ?result.source,
            attempts = result.attempts.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "resolve_complete"
        );
        result
    }

    /// Looks the record up in the primary source, then resolves it. A failed
    /// lookup is downgraded to an empty record so scraping takes over. The
    /// fetched record is upstream data and skips the caller URL checks.
    pub async fn resolve_app(
        &self,
        subject_id: &str,
        country: &str,
        options: ResolveOptions,
        mode: ResolveMode,
    ) -> Result<AppResolution, PipelineError> {
        let (subject_id, country) = check_subject("resolve_app", subject_id, country)?;
        check_retries("resolve_app", options.max_retries)?;

        let record = match self.fetch_record(&subject_id, &country).await {
            Ok(record) => record,
            Err(err) => {
                warn!(target = "argus.pipeline", subject_id = %subject_id, country = %country, error = %err, "primary_lookup_failed");
                AppRecord::default()
            }
        };

        match mode {
            ResolveMode::Chain => {
                let result = self.run_chain(&record, &subject_id, &country, options).await;
                Ok(AppResolution::Chain(result))
            }
            ResolveMode::FillMissing => {
                let record = self.chain.fill_missing(&record, &subject_id, &country).await;
                Ok(AppResolution::FillMissing { record })
            }
        }
    }

    pub async fn fetch_record(&self, subject_id: &str, country: &str) -> Result<AppRecord, PipelineError> {
        self.source
            .fetch_app_record(subject_id, country)
            .await
            .map_err(|err| PipelineError::from_catalog("primary_lookup", err))
    }

    /// Clears the whole validation cache, or a single entry when a key is
    /// given. Returns how many live entries were dropped.
    pub async fn clear_validation_cache(
        &self,
        key: Option<(&str, &str)>,
    ) -> Result<usize, PipelineError> {
        let cache = self.validator.cache();
        match key {
            None => Ok(cache.clear().await),
            Some((subject_id, country)) => {
                let (subject_id, country) = check_subject("validation_cache", subject_id, country)?;
                if cache.remove(&subject_id, &country).await {
                    Ok(1)
                } else {
                    Err(PipelineError::not_found(
                        "validation_cache",
                        format!("no cached validation for {subject_id}/{country}"),
                    ))
                }
            }
        }
    }

    pub async fn cached_validations(&self) -> usize {
        self.validator.cache().len().await
    }

    fn check_urls(&self, stage: &'static str, urls: &[String]) -> Result<(), PipelineError> {
        if urls.len() > self.config.max_input_urls {
            return Err(PipelineError::invalid_input(
                stage,
                format!("too_many_urls: {} > {}", urls.len(), self.config.max_input_urls),
            ));
        }
        if urls.iter().any(|u| u.trim().is_empty()) {
            return Err(PipelineError::invalid_input(stage, "empty_url"));
        }
        Ok(())
    }

    fn check_collections(
        &self,
        stage: &'static str,
        collections: &PlatformCollections,
    ) -> Result<(), PipelineError> {
        for (_, urls) in collections.iter() {
            self.check_urls(stage, urls)?;
        }
        Ok(())
    }
}

fn parse_platform(stage: &'static str, raw: &str) -> Result<Platform, PipelineError> {
    raw.parse::<Platform>()
        .map_err(|err| PipelineError::invalid_input(stage, format!("unknown_platform: {}", err.0)))
}

fn check_subject(
    stage: &'static str,
    subject_id: &str,
    country: &str,
) -> Result<(String, String), PipelineError> {
    let subject_id = subject_id.trim();
    if subject_id.is_empty() {
        return Err(PipelineError::invalid_input(stage, "empty_subject_id"));
    }
    if subject_id.len() > MAX_SUBJECT_ID_LEN
        || !subject_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(PipelineError::invalid_input(
            stage,
            format!("invalid_subject_id: {subject_id}"),
        ));
    }
    let country = country.trim();
    if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(PipelineError::invalid_input(
            stage,
            format!("invalid_country: {country}"),
        ));
    }
    Ok((subject_id.to_string(), country.to_ascii_lowercase()))
}

fn check_retries(stage: &'static str, max_retries: u32) -> Result<(), PipelineError> {
    if max_retries > MAX_RETRIES_LIMIT {
        return Err(PipelineError::invalid_input(
            stage,
            format!("max_retries must be within 0..={MAX_RETRIES_LIMIT}"),
        ));
    }
    Ok(())
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    SourceUnavailable,
    ParseFailure,
    ValidationFailure,
    NotFound,
}

impl PipelineError {
    pub fn new(stage: &'static str, kind: PipelineErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::InvalidInput, message)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, PipelineErrorKind::NotFound, message)
    }

    pub fn from_fetch(stage: &'static str, err: FetchError) -> Self {
        let kind = match &err {
            FetchError::Status(404) => PipelineErrorKind::NotFound,
            FetchError::Body(_) => PipelineErrorKind::ParseFailure,
            FetchError::Timeout(_) | FetchError::Request(_) | FetchError::Status(_) => {
                PipelineErrorKind::SourceUnavailable
            }
        };
        Self::new(stage, kind, err.to_string())
    }

    pub fn from_catalog(stage: &'static str, err: CatalogError) -> Self {
        let kind = match &err {
            CatalogError::NotFound(_) => PipelineErrorKind::NotFound,
            CatalogError::Request(_) => PipelineErrorKind::SourceUnavailable,
            CatalogError::Deserialize(_) => PipelineErrorKind::ParseFailure,
        };
        Self::new(stage, kind, err.to_string())
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}
