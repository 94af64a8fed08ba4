//! Candidate signal retrieval.
//!
//! Popularity, co-visitation, content similarity and the user profile are
//! fetched concurrently under the request context. A failing source is
//! logged, counted and treated as empty; the request only fails when every
//! attempted source failed or the request was cancelled.

use chrono::{DateTime, Duration, Utc};
use recsys_cache::ArtifactCache;
use recsys_core::recommendation::RecommendationConfig;
use recsys_core::store::PopQuery;
use recsys_core::types::{ItemScore, ProfileTag};
use recsys_core::{RecsysError, RecsysResult, RequestCtx, Store, Warning};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

pub const SOURCE_POPULARITY: &str = "popularity";
pub const SOURCE_CO_VISITATION: &str = "co_visitation";
pub const SOURCE_SIMILARITY: &str = "similarity";
pub const SOURCE_PROFILE: &str = "profile";
pub const SOURCE_ANCHORS: &str = "anchors";

pub const WARNING_SIGNAL_UNAVAILABLE: &str = "SIGNAL_UNAVAILABLE";

pub(crate) const PER_ANCHOR_LIMIT: usize = 200;
const RECENT_ANCHOR_LIMIT: usize = 10;
/// Cached popularity lists are computed as of the start of this bucket.
const POPULARITY_BUCKET_SECS: i64 = 60;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SourceStat {
    pub count: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct SourceRequest<'a> {
    pub tenant: Uuid,
    pub namespace: &'a str,
    pub surface: &'a str,
    pub subject: &'a str,
    pub k: usize,
    pub now: DateTime<Utc>,
    pub request_anchors: &'a [String],
    pub max_anchors: usize,
    pub config: &'a RecommendationConfig,
    pub want_co_vis: bool,
    pub want_similarity: bool,
    pub want_profile: bool,
    /// Popularity lists shared per (tenant, surface, popularity inputs) for
    /// the cache TTL.
    pub popularity_cache: Option<&'a ArtifactCache>,
}

/// Raw per-source results for one request.
#[derive(Debug, Clone, Default)]
pub struct Signals {
    pub popularity: Vec<ItemScore>,
    /// Best co-visitation score per item over all anchors.
    pub co_vis: HashMap<String, f64>,
    /// Best similarity score per item over all anchors.
    pub similarity: HashMap<String, f64>,
    pub profile: Vec<ProfileTag>,
    /// Events in the profile window; `None` when unknown.
    pub user_events: Option<usize>,
    pub anchors: Vec<String>,
    pub anchors_from_request: bool,
    pub stats: BTreeMap<String, SourceStat>,
    pub warnings: Vec<Warning>,
}

impl Signals {
    /// Record a source outcome. Cancellation propagates, any other error
    /// degrades the source to empty. `Ok(None)` means not attempted.
    fn settle<T>(
        &mut self,
        source: &str,
        (result, duration_ms): (RecsysResult<Option<T>>, u64),
        count: impl Fn(&T) -> usize,
        tally: &mut Tally,
    ) -> RecsysResult<Option<T>> {
        match result {
            Ok(None) => Ok(None),
            Ok(Some(value)) => {
                tally.attempted += 1;
                self.stats.insert(
                    source.to_string(),
                    SourceStat {
                        count: count(&value),
                        duration_ms,
                        error: None,
                    },
                );
                Ok(Some(value))
            }
            Err(RecsysError::Cancelled) => Err(RecsysError::Cancelled),
            Err(e) => {
                tally.attempted += 1;
                tally.failed += 1;
                self.degrade(source, &e, duration_ms);
                Ok(None)
            }
        }
    }

    fn degrade(&mut self, source: &str, err: &RecsysError, duration_ms: u64) {
        warn!(source, error = %err, "Candidate source failed");
        metrics::counter!("recsys.source.errors", "source" => source.to_string()).increment(1);
        self.stats.insert(
            source.to_string(),
            SourceStat {
                count: 0,
                duration_ms,
                error: Some(err.public_detail()),
            },
        );
        self.warnings.push(Warning::new(
            WARNING_SIGNAL_UNAVAILABLE,
            format!("{source} unavailable"),
        ));
    }

    pub fn stats_json(&self) -> Option<serde_json::Value> {
        if self.stats.is_empty() {
            return None;
        }
        serde_json::to_value(&self.stats).ok()
    }
}

#[derive(Default)]
struct Tally {
    attempted: usize,
    failed: usize,
}

/// `now` minus `days`, saturating at the earliest representable instant.
pub(crate) fn days_before(now: DateTime<Utc>, days: f64) -> DateTime<Utc> {
    // Float to int casts saturate and map NaN to zero.
    let millis = (days.max(0.0) * 86_400_000.0) as i64;
    Duration::try_milliseconds(millis)
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn bucket_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let secs = now.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(POPULARITY_BUCKET_SECS), 0).unwrap_or(now)
}

/// Cache scope covering every input a popularity list depends on besides
/// the tenant, surface and store contents.
fn popularity_scope(
    namespace: &str,
    cfg: &RecommendationConfig,
    fetch_limit: usize,
    as_of: DateTime<Utc>,
) -> String {
    let mut excluded: Vec<String> = cfg
        .exclude_event_types
        .iter()
        .map(|e| e.trim().to_ascii_lowercase())
        .collect();
    excluded.sort();
    excluded.dedup();
    format!(
        "{namespace}|hl={:016x}|n={fetch_limit}|ex={}|t={}",
        cfg.half_life_days.to_bits(),
        excluded.join(","),
        as_of.timestamp()
    )
}

async fn timed<T>(fut: impl Future<Output = RecsysResult<T>>) -> (RecsysResult<T>, u64) {
    let started = Instant::now();
    let result = fut.await;
    (result, started.elapsed().as_millis() as u64)
}

fn merge_max(into: &mut HashMap<String, f64>, scores: Vec<ItemScore>) {
    for s in scores {
        let slot = into.entry(s.item_id).or_insert(s.score);
        if s.score > *slot {
            *slot = s.score;
        }
    }
}

/// Fetch every requested signal.
pub async fn gather(
    ctx: &RequestCtx,
    store: &dyn Store,
    req: &SourceRequest<'_>,
) -> RecsysResult<Signals> {
    let cfg = req.config;
    let mut signals = Signals::default();
    let mut tally = Tally::default();

    // Anchors come from the request, else from the subject's recent history
    // when an anchor-driven signal is wanted.
    let anchor_cap = req.max_anchors.min(cfg.max_anchors_injected);
    if !req.request_anchors.is_empty() {
        signals.anchors = req.request_anchors.iter().take(anchor_cap).cloned().collect();
        signals.anchors_from_request = true;
    } else if (req.want_co_vis || req.want_similarity) && !req.subject.is_empty() {
        let since = days_before(req.now, cfg.co_vis_window_days);
        let limit = RECENT_ANCHOR_LIMIT.min(anchor_cap);
        let fetched = timed(async {
            if limit == 0 {
                return Ok(None);
            }
            ctx.run(store.list_user_recent_items(req.tenant, req.namespace, req.subject, since, limit))
                .await
                .map(Some)
        })
        .await;
        match fetched {
            (Ok(Some(items)), duration_ms) => {
                signals.stats.insert(
                    SOURCE_ANCHORS.to_string(),
                    SourceStat {
                        count: items.len(),
                        duration_ms,
                        error: None,
                    },
                );
                signals.anchors = items;
            }
            (Ok(None), _) => {}
            (Err(RecsysError::Cancelled), _) => return Err(RecsysError::Cancelled),
            (Err(e), duration_ms) => signals.degrade(SOURCE_ANCHORS, &e, duration_ms),
        }
    }

    let anchors = signals.anchors.clone();
    let co_vis_since = days_before(req.now, cfg.co_vis_window_days);
    let profile_since = days_before(req.now, cfg.profile_window_days);

    let popularity = timed(async {
        let limit = cfg.popularity_fanout.max(req.k);
        let fetch = |limit: usize, now: DateTime<Utc>| async move {
            let mut event_types = ctx.run(store.event_types(req.tenant)).await?;
            event_types.retain(|code, _| {
                !cfg.exclude_event_types
                    .iter()
                    .any(|excluded| excluded.eq_ignore_ascii_case(code))
            });
            let query = PopQuery {
                half_life_days: cfg.half_life_days,
                limit,
                now,
                event_types,
            };
            ctx.run(store.list_pop_items(req.tenant, req.namespace, &query))
                .await
        };
        let items = match req.popularity_cache {
            Some(cache) => {
                // Cached lists are fetched wide enough for any k and scored
                // as of the bucket start so every reader sees the same list.
                let fetch_limit = limit.max(cfg.max_k);
                let as_of = bucket_start(req.now);
                let scope = popularity_scope(req.namespace, cfg, fetch_limit, as_of);
                let shared = cache
                    .get_or_load_scoped(req.tenant, req.surface, &scope, || async {
                        fetch(fetch_limit, as_of).await.map(Arc::new)
                    })
                    .await?;
                shared.iter().take(limit).cloned().collect()
            }
            None => fetch(limit, req.now).await?,
        };
        Ok::<_, RecsysError>(Some(items))
    });

    let co_vis = timed(async {
        if !req.want_co_vis || anchors.is_empty() {
            return Ok::<_, RecsysError>(None);
        }
        let mut merged = HashMap::new();
        for anchor in &anchors {
            let scores = ctx
                .run(store.list_co_vis(req.tenant, req.namespace, anchor, co_vis_since, PER_ANCHOR_LIMIT))
                .await?;
            merge_max(&mut merged, scores);
        }
        Ok(Some(merged))
    });

    let similarity = timed(async {
        if !req.want_similarity || anchors.is_empty() {
            return Ok::<_, RecsysError>(None);
        }
        let mut merged = HashMap::new();
        for anchor in &anchors {
            let scores = ctx
                .run(store.list_similar(req.tenant, req.namespace, anchor, PER_ANCHOR_LIMIT))
                .await?;
            merge_max(&mut merged, scores);
        }
        Ok(Some(merged))
    });

    let profile = timed(async {
        if !req.want_profile || req.subject.is_empty() {
            return Ok::<_, RecsysError>(None);
        }
        let tags = ctx
            .run(store.get_user_profile(
                req.tenant,
                req.namespace,
                req.subject,
                profile_since,
                cfg.profile_top_n,
            ))
            .await?;
        let events = ctx
            .run(store.count_user_events(req.tenant, req.namespace, req.subject, profile_since))
            .await?;
        Ok(Some((tags, events)))
    });

    let (popularity, co_vis, similarity, profile) =
        tokio::join!(popularity, co_vis, similarity, profile);

    if let Some(items) = signals.settle(SOURCE_POPULARITY, popularity, Vec::len, &mut tally)? {
        signals.popularity = items;
    }
    if let Some(scores) = signals.settle(SOURCE_CO_VISITATION, co_vis, HashMap::len, &mut tally)? {
        signals.co_vis = scores;
    }
    if let Some(scores) = signals.settle(SOURCE_SIMILARITY, similarity, HashMap::len, &mut tally)? {
        signals.similarity = scores;
    }
    if let Some((tags, events)) =
        signals.settle(SOURCE_PROFILE, profile, |(tags, _)| tags.len(), &mut tally)?
    {
        signals.profile = tags;
        signals.user_events = Some(events);
    }

    if tally.attempted > 0 && tally.failed == tally.attempted {
        return Err(RecsysError::internal("all candidate sources failed"));
    }
    Ok(signals)
}
