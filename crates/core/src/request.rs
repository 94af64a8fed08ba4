//! Wire request types and the normalizer that validates them.
//!
//! The normalizer trims and dedups list fields, applies defaults (each
//! recorded as a `DEFAULT_APPLIED` warning) and rejects malformed input
//! with `Invalid` (400) or `Unprocessable` (422) errors.

use crate::error::{RecsysError, RecsysResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

pub const DEFAULT_SEGMENT: &str = "default";
pub const DEFAULT_K: usize = 20;
pub const MAX_K: usize = 200;
pub const DEFAULT_MAX_ANCHORS: usize = 50;
pub const MAX_ANCHOR_IDS: usize = 50;
pub const MAX_INCLUDE_IDS: usize = 5000;
pub const MAX_EXCLUDE_IDS: usize = 5000;
pub const MAX_TAGS: usize = 200;

pub const WARNING_DEFAULT_APPLIED: &str = "DEFAULT_APPLIED";

/// Non-fatal note attached to a successful response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Warning {
    pub code: String,
    pub detail: String,
}

impl Warning {
    pub fn new(code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            detail: detail.into(),
        }
    }
}

// ─── Wire DTOs ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UserRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub anonymous_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
}

impl UserRef {
    /// The identity used for history lookups: user, then session, then
    /// anonymous id.
    pub fn subject_key(&self) -> &str {
        if !self.user_id.is_empty() {
            &self.user_id
        } else if !self.session_id.is_empty() {
            &self.session_id
        } else {
            &self.anonymous_id
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RequestContext {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub locale: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub country: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub now: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Anchors {
    #[serde(default)]
    pub item_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_anchors: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Candidates {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbidden_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub max_per_tag: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Weights {
    #[serde(default)]
    pub pop: f64,
    #[serde(default)]
    pub cooc: f64,
    #[serde(default)]
    pub emb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Options {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_reasons: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_trace: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExperimentRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub variant: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RecommendRequest {
    #[serde(default)]
    pub surface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<RequestContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchors: Option<Anchors>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Candidates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<Weights>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Options>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment: Option<ExperimentRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SimilarRequest {
    #[serde(default)]
    pub surface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment: Option<String>,
    #[serde(default)]
    pub item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Options>,
}

// ─── Normalized forms ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExplainLevel {
    #[default]
    None,
    Summary,
    Full,
}

impl ExplainLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Summary => "summary",
            Self::Full => "full",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedContext {
    pub locale: String,
    pub device: String,
    pub country: String,
    pub now: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedAnchors {
    pub item_ids: Vec<String>,
    pub max_anchors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NormalizedConstraints {
    pub required_tags: Vec<String>,
    pub forbidden_tags: Vec<String>,
    pub max_per_tag: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct NormalizedOptions {
    pub include_reasons: bool,
    pub explain: ExplainLevel,
    pub include_trace: bool,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedRecommendRequest {
    pub surface: String,
    pub segment: String,
    pub k: usize,
    pub user: UserRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<NormalizedContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchors: Option<NormalizedAnchors>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Candidates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<NormalizedConstraints>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<Weights>,
    pub options: NormalizedOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment: Option<ExperimentRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedSimilarRequest {
    pub surface: String,
    pub segment: String,
    pub item_id: String,
    pub k: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<NormalizedConstraints>,
    pub options: NormalizedOptions,
}

impl From<&NormalizedOptions> for Options {
    fn from(o: &NormalizedOptions) -> Self {
        Options {
            include_reasons: Some(o.include_reasons),
            explain: Some(o.explain.as_str().to_string()),
            include_trace: Some(o.include_trace),
            seed: Some(o.seed),
        }
    }
}

impl From<&NormalizedConstraints> for Constraints {
    fn from(c: &NormalizedConstraints) -> Self {
        Constraints {
            required_tags: c.required_tags.clone(),
            forbidden_tags: c.forbidden_tags.clone(),
            max_per_tag: c
                .max_per_tag
                .iter()
                .map(|(k, v)| (k.clone(), *v as i64))
                .collect(),
        }
    }
}

/// Lift a normalized request back into wire form.
impl From<&NormalizedRecommendRequest> for RecommendRequest {
    fn from(n: &NormalizedRecommendRequest) -> Self {
        RecommendRequest {
            surface: n.surface.clone(),
            segment: Some(n.segment.clone()),
            k: Some(n.k as i64),
            user: Some(n.user.clone()),
            context: n.context.as_ref().map(|c| RequestContext {
                locale: c.locale.clone(),
                device: c.device.clone(),
                country: c.country.clone(),
                now: c
                    .now
                    .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                    .unwrap_or_default(),
            }),
            anchors: n.anchors.as_ref().map(|a| Anchors {
                item_ids: a.item_ids.clone(),
                max_anchors: Some(a.max_anchors as i64),
            }),
            candidates: n.candidates.clone(),
            constraints: n.constraints.as_ref().map(Constraints::from),
            weights: n.weights,
            options: Some(Options::from(&n.options)),
            experiment: n.experiment.clone(),
        }
    }
}

// ─── Normalizer ─────────────────────────────────────────────────────────────

pub fn normalize_recommend(
    dto: &RecommendRequest,
) -> RecsysResult<(NormalizedRecommendRequest, Vec<Warning>)> {
    let mut warnings = Vec::new();

    let surface = dto.surface.trim();
    if surface.is_empty() {
        return Err(RecsysError::invalid("surface is required"));
    }
    let segment = normalize_segment(dto.segment.as_deref(), &mut warnings);
    let k = normalize_k(dto.k, &mut warnings)?;

    let user = dto
        .user
        .as_ref()
        .map(|u| UserRef {
            user_id: u.user_id.trim().to_string(),
            anonymous_id: u.anonymous_id.trim().to_string(),
            session_id: u.session_id.trim().to_string(),
        })
        .unwrap_or_default();
    if user.user_id.is_empty() && user.anonymous_id.is_empty() && user.session_id.is_empty() {
        return Err(RecsysError::unprocessable(
            "user_id or anonymous_id or session_id is required",
        ));
    }

    let context = dto.context.as_ref().map(normalize_context).transpose()?;
    let anchors = dto
        .anchors
        .as_ref()
        .map(|a| normalize_anchors(a, &mut warnings))
        .transpose()?;
    let candidates = dto.candidates.as_ref().map(normalize_candidates).transpose()?.flatten();
    let constraints = dto.constraints.as_ref().map(normalize_constraints).transpose()?.flatten();
    let weights = dto.weights.map(normalize_weights).transpose()?;
    let options = normalize_options(dto.options.as_ref(), &mut warnings)?;
    let experiment = dto.experiment.as_ref().and_then(normalize_experiment);

    Ok((
        NormalizedRecommendRequest {
            surface: surface.to_string(),
            segment,
            k,
            user,
            context,
            anchors,
            candidates,
            constraints,
            weights,
            options,
            experiment,
        },
        warnings,
    ))
}

pub fn normalize_similar(
    dto: &SimilarRequest,
) -> RecsysResult<(NormalizedSimilarRequest, Vec<Warning>)> {
    let mut warnings = Vec::new();

    let surface = dto.surface.trim();
    if surface.is_empty() {
        return Err(RecsysError::invalid("surface is required"));
    }
    let segment = normalize_segment(dto.segment.as_deref(), &mut warnings);
    let item_id = dto.item_id.trim();
    if item_id.is_empty() {
        return Err(RecsysError::invalid("item_id is required"));
    }
    let k = normalize_k(dto.k, &mut warnings)?;
    let constraints = dto.constraints.as_ref().map(normalize_constraints).transpose()?.flatten();
    let options = normalize_options(dto.options.as_ref(), &mut warnings)?;

    Ok((
        NormalizedSimilarRequest {
            surface: surface.to_string(),
            segment,
            item_id: item_id.to_string(),
            k,
            constraints,
            options,
        },
        warnings,
    ))
}

fn normalize_segment(raw: Option<&str>, warnings: &mut Vec<Warning>) -> String {
    match raw.map(str::trim) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => {
            warnings.push(Warning::new(
                WARNING_DEFAULT_APPLIED,
                "segment defaulted to 'default'",
            ));
            DEFAULT_SEGMENT.to_string()
        }
    }
}

fn normalize_k(raw: Option<i64>, warnings: &mut Vec<Warning>) -> RecsysResult<usize> {
    let k = match raw {
        Some(k) => k,
        None => {
            warnings.push(Warning::new(WARNING_DEFAULT_APPLIED, "k defaulted to 20"));
            DEFAULT_K as i64
        }
    };
    if k < 1 || k > MAX_K as i64 {
        return Err(RecsysError::invalid("k must be between 1 and 200"));
    }
    Ok(k as usize)
}

fn normalize_context(ctx: &RequestContext) -> RecsysResult<NormalizedContext> {
    let now = match ctx.now.trim() {
        "" => None,
        raw => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|_| RecsysError::invalid("context.now must be RFC3339"))?
                .with_timezone(&Utc),
        ),
    };
    Ok(NormalizedContext {
        locale: ctx.locale.trim().to_string(),
        device: ctx.device.trim().to_string(),
        country: ctx.country.trim().to_string(),
        now,
    })
}

fn normalize_anchors(a: &Anchors, warnings: &mut Vec<Warning>) -> RecsysResult<NormalizedAnchors> {
    let ids = normalize_list(&a.item_ids, false);
    if ids.len() > MAX_ANCHOR_IDS {
        return Err(RecsysError::invalid("anchors.item_ids exceeds limit"));
    }
    let max_anchors = match a.max_anchors {
        Some(v) => v,
        None => {
            warnings.push(Warning::new(
                WARNING_DEFAULT_APPLIED,
                "anchors.max_anchors defaulted to 50",
            ));
            DEFAULT_MAX_ANCHORS as i64
        }
    };
    if max_anchors < ids.len() as i64 {
        return Err(RecsysError::unprocessable(
            "anchors.max_anchors must be >= number of anchor items",
        ));
    }
    if max_anchors <= 0 {
        return Err(RecsysError::invalid("anchors.max_anchors must be positive"));
    }
    Ok(NormalizedAnchors {
        item_ids: ids,
        max_anchors: max_anchors as usize,
    })
}

fn normalize_candidates(c: &Candidates) -> RecsysResult<Option<Candidates>> {
    let include_ids = normalize_list(&c.include_ids, false);
    let exclude_ids = normalize_list(&c.exclude_ids, false);
    if include_ids.len() > MAX_INCLUDE_IDS {
        return Err(RecsysError::invalid("candidates.include_ids exceeds limit"));
    }
    if exclude_ids.len() > MAX_EXCLUDE_IDS {
        return Err(RecsysError::invalid("candidates.exclude_ids exceeds limit"));
    }
    if include_ids.is_empty() && exclude_ids.is_empty() {
        return Ok(None);
    }
    Ok(Some(Candidates {
        include_ids,
        exclude_ids,
    }))
}

pub fn normalize_constraints(c: &Constraints) -> RecsysResult<Option<NormalizedConstraints>> {
    let required_tags = normalize_list(&c.required_tags, true);
    let forbidden_tags = normalize_list(&c.forbidden_tags, true);
    if required_tags.len() > MAX_TAGS || forbidden_tags.len() > MAX_TAGS {
        return Err(RecsysError::invalid("constraints tags exceed limit"));
    }
    let mut max_per_tag = BTreeMap::new();
    for (k, v) in &c.max_per_tag {
        let key = k.trim().to_lowercase();
        if key.is_empty() {
            continue;
        }
        if *v < 0 {
            return Err(RecsysError::unprocessable(
                "constraints.max_per_tag values must be non-negative",
            ));
        }
        max_per_tag.insert(key, *v as usize);
    }
    if required_tags.is_empty() && forbidden_tags.is_empty() && max_per_tag.is_empty() {
        return Ok(None);
    }
    Ok(Some(NormalizedConstraints {
        required_tags,
        forbidden_tags,
        max_per_tag,
    }))
}

fn normalize_weights(w: Weights) -> RecsysResult<Weights> {
    if w.pop < 0.0 || w.cooc < 0.0 || w.emb < 0.0 {
        return Err(RecsysError::unprocessable("weights must be non-negative"));
    }
    if !(w.pop.is_finite() && w.cooc.is_finite() && w.emb.is_finite()) {
        return Err(RecsysError::invalid("weights must be finite"));
    }
    Ok(w)
}

fn normalize_options(
    o: Option<&Options>,
    warnings: &mut Vec<Warning>,
) -> RecsysResult<NormalizedOptions> {
    let Some(o) = o else {
        warnings.push(Warning::new(WARNING_DEFAULT_APPLIED, "options defaulted"));
        return Ok(NormalizedOptions::default());
    };
    let explain = match o.explain.as_deref().map(|s| s.trim().to_lowercase()) {
        None => ExplainLevel::None,
        Some(s) => match s.as_str() {
            "" | "none" => ExplainLevel::None,
            "summary" => ExplainLevel::Summary,
            "full" => ExplainLevel::Full,
            _ => {
                return Err(RecsysError::unprocessable(
                    "options.explain must be one of none, summary, full",
                ))
            }
        },
    };
    Ok(NormalizedOptions {
        include_reasons: o.include_reasons.unwrap_or(false),
        explain,
        include_trace: o.include_trace.unwrap_or(false),
        seed: o.seed.unwrap_or(0),
    })
}

fn normalize_experiment(e: &ExperimentRef) -> Option<ExperimentRef> {
    let id = e.id.trim();
    let variant = e.variant.trim();
    if id.is_empty() && variant.is_empty() {
        return None;
    }
    Some(ExperimentRef {
        id: id.to_string(),
        variant: variant.to_string(),
    })
}

/// Trim, drop empties and dedup preserving first occurrence. Tags are
/// additionally lowercased.
pub fn normalize_list(values: &[String], lower: bool) -> Vec<String> {
    let mut seen = HashSet::with_capacity(values.len());
    let mut out = Vec::with_capacity(values.len());
    for v in values {
        let mut item = v.trim().to_string();
        if lower {
            item = item.to_lowercase();
        }
        if item.is_empty() || !seen.insert(item.clone()) {
            continue;
        }
        out.push(item);
    }
    out
}
