//! Maps a request onto a segment and its tuning profile.

use crate::predicates::Evaluator;
use chrono::{DateTime, Utc};
use recsys_core::request::NormalizedRecommendRequest;
use recsys_core::types::{Segment, SegmentProfile, SegmentRule};
use recsys_core::{RecsysResult, RequestCtx, Store};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_SEGMENT: &str = "default";

/// Outcome of segment selection. Empty when no segment applies.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SegmentSelection {
    pub segment_id: String,
    pub profile_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<SegmentProfile>,
    pub user_traits: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_created: Option<DateTime<Utc>>,
    /// Rule that matched; `None` for unconditional or fallback matches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

impl SegmentSelection {
    pub fn is_empty(&self) -> bool {
        self.segment_id.is_empty()
    }
}

pub struct SegmentSelector {
    store: Arc<dyn Store>,
}

impl SegmentSelector {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Walk active segments in listed order and return the first whose
    /// enabled rules match. Falls back to the `default` segment.
    pub async fn select(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        ns: &str,
        req: &NormalizedRecommendRequest,
        now: DateTime<Utc>,
    ) -> RecsysResult<SegmentSelection> {
        let segments = ctx
            .run(self.store.list_active_segments_with_rules(tenant, ns))
            .await?;
        if segments.is_empty() {
            return Ok(SegmentSelection::default());
        }

        let user_id = req.user.user_id.as_str();
        let user = if user_id.is_empty() {
            None
        } else {
            ctx.run(self.store.get_user(tenant, ns, user_id)).await?
        };
        let traits = user
            .as_ref()
            .map(|u| u.traits.clone())
            .filter(|t| !t.is_null())
            .unwrap_or_else(|| Value::Object(Map::new()));
        let user_created = user.as_ref().map(|u| u.created_at);

        let bundle = context_bundle(ns, req, &traits);
        let evaluator = Evaluator::new(&bundle, now);

        let mut fallback: Option<&Segment> = None;
        for segment in &segments {
            if segment.segment_id == DEFAULT_SEGMENT {
                fallback = Some(segment);
            }
            if let Some(rule_id) = segment_matches(segment, &evaluator) {
                debug!(segment = %segment.segment_id, rule = ?rule_id, "Segment matched");
                return self
                    .resolve(ctx, tenant, ns, segment, rule_id, traits, user_created)
                    .await;
            }
        }

        match fallback {
            Some(segment) => {
                self.resolve(ctx, tenant, ns, segment, None, traits, user_created)
                    .await
            }
            None => Ok(SegmentSelection {
                user_traits: traits,
                user_created,
                ..Default::default()
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve(
        &self,
        ctx: &RequestCtx,
        tenant: Uuid,
        ns: &str,
        segment: &Segment,
        rule_id: Option<String>,
        user_traits: Value,
        user_created: Option<DateTime<Utc>>,
    ) -> RecsysResult<SegmentSelection> {
        let profile = if segment.profile_id.is_empty() {
            None
        } else {
            ctx.run(self.store.get_segment_profile(tenant, ns, &segment.profile_id))
                .await?
                .filter(|p| match p.overrides.validate() {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(%tenant, profile_id = %p.profile_id, error = %e, "Ignoring invalid segment profile");
                        false
                    }
                })
        };
        Ok(SegmentSelection {
            segment_id: segment.segment_id.clone(),
            profile_id: profile
                .as_ref()
                .map(|p| p.profile_id.clone())
                .unwrap_or_default(),
            profile,
            user_traits,
            user_created,
            rule_id,
        })
    }
}

/// `Some(rule_id)` when a rule matched, `Some(None)` for an unconditional
/// segment, `None` when nothing matched. Malformed rules are skipped.
fn segment_matches(segment: &Segment, evaluator: &Evaluator<'_>) -> Option<Option<String>> {
    if segment.rules.is_empty() {
        return Some(None);
    }
    segment
        .rules
        .iter()
        .filter(|r| r.enabled)
        .find(|r| rule_matches(r, evaluator))
        .map(|r| Some(r.rule_id.clone()))
}

fn rule_matches(rule: &SegmentRule, evaluator: &Evaluator<'_>) -> bool {
    match evaluator.matches(&rule.expr) {
        Ok(matched) => matched,
        Err(e) => {
            debug!(rule = %rule.rule_id, error = %e, "Skipping segment rule");
            metrics::counter!("recsys.segment.rule_errors").increment(1);
            false
        }
    }
}

/// `{user: {id, traits}, ctx: {...}, request: {namespace, surface, k, blend?}}`
pub fn context_bundle(ns: &str, req: &NormalizedRecommendRequest, traits: &Value) -> Value {
    let mut ctx = Map::new();
    if let Some(c) = &req.context {
        for (key, value) in [("locale", &c.locale), ("device", &c.device), ("country", &c.country)] {
            if !value.is_empty() {
                ctx.insert(key.to_string(), Value::String(value.clone()));
            }
        }
        if let Some(now) = c.now {
            ctx.insert("now".to_string(), Value::String(now.to_rfc3339()));
        }
    }
    let mut request = json!({
        "namespace": ns,
        "surface": req.surface,
        "k": req.k,
    });
    if let (Some(w), Some(obj)) = (&req.weights, request.as_object_mut()) {
        obj.insert(
            "blend".to_string(),
            json!({"pop": w.pop, "cooc": w.cooc, "emb": w.emb}),
        );
    }
    json!({
        "user": {"id": req.user.user_id, "traits": traits},
        "ctx": ctx,
        "request": request,
    })
}
