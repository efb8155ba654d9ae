//! Multi-resolution summary index over numeric attributes.
//!
//! For a registered attribute `A` and each selected summary kind, the writer
//! maintains a chain of synthetic attributes `A/max-levels/max1, max2, ...`
//! where level `i` summarizes `resolution^i` consecutive base intervals.
//! Level chunks close with a carry chain: when the update counter hits
//! `resolution^i`, the level-`i` accumulator is emitted as a closed interval
//! and folded into level `i+1`, exactly like carrying in a mixed-radix
//! counter.
//!
//! Averages are time-weighted over the actual interval durations, never a
//! simple mean; Null base values weigh zero in the numerator but their
//! duration still counts. Min/max skip Null entirely.
//!
//! The writer composes around the state-system handle: a provider routes the
//! `modify_attribute` calls of summarized attributes through
//! [`MipmapWriter::modify_attribute`], everything else goes to the state
//! system directly. Attributes that never see a numeric value never grow
//! level nodes, and range queries against them transparently fall back to a
//! plain base-interval scan.

use std::collections::HashMap;

use crate::errors::Result;
use crate::interval::Quark;
use crate::system::StateSystem;
use crate::value::StateValue;

/// Base updates per level-1 chunk; level `i` covers `resolution^i` updates.
pub const DEFAULT_RESOLUTION: u64 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MipmapKind {
    Min,
    Max,
    Avg,
}

impl MipmapKind {
    fn dir(&self) -> &'static str {
        match self {
            MipmapKind::Min => "min-levels",
            MipmapKind::Max => "max-levels",
            MipmapKind::Avg => "avg-levels",
        }
    }

    fn node(&self, level: usize) -> String {
        match self {
            MipmapKind::Min => format!("min{level}"),
            MipmapKind::Max => format!("max{level}"),
            MipmapKind::Avg => format!("avg{level}"),
        }
    }
}

/// Running accumulator for one open chunk at one level.
#[derive(Clone, Debug)]
struct ChunkAccum {
    /// Timestamp the open chunk started at.
    start: i64,
    /// Total duration folded in so far.
    covered: i64,
    /// Time-weighted sum (value x duration) for averaging.
    sum: f64,
    min: Option<StateValue>,
    max: Option<StateValue>,
}

impl ChunkAccum {
    fn new(start: i64) -> Self {
        Self {
            start,
            covered: 0,
            sum: 0.0,
            min: None,
            max: None,
        }
    }

    /// Fold one closed base interval in. Null (and any stray non-numeric)
    /// values weigh zero but their duration still counts, so averages stay
    /// exact over the chunk's full time span.
    fn absorb_interval(&mut self, start: i64, end: i64, value: &StateValue) {
        let dur = end - start + 1;
        self.sum += value.to_f64().unwrap_or(0.0) * dur as f64;
        self.covered += dur;
        if value.is_numeric() {
            merge_extreme(&mut self.min, value, MipmapKind::Min);
            merge_extreme(&mut self.max, value, MipmapKind::Max);
        }
    }

    /// Fold a finished finer-level chunk in, carrying its raw weighted sum
    /// so averages stay exact across levels.
    fn absorb_chunk(&mut self, child: &ChunkAccum) {
        self.sum += child.sum;
        self.covered += child.covered;
        if let Some(v) = &child.min {
            merge_extreme(&mut self.min, v, MipmapKind::Min);
        }
        if let Some(v) = &child.max {
            merge_extreme(&mut self.max, v, MipmapKind::Max);
        }
    }

    fn value_for(&self, kind: MipmapKind) -> StateValue {
        match kind {
            MipmapKind::Min => self.min.clone().unwrap_or(StateValue::Null),
            MipmapKind::Max => self.max.clone().unwrap_or(StateValue::Null),
            MipmapKind::Avg => {
                if self.covered > 0 {
                    StateValue::Double(self.sum / self.covered as f64)
                } else {
                    StateValue::Null
                }
            }
        }
    }
}

fn merge_extreme(slot: &mut Option<StateValue>, candidate: &StateValue, kind: MipmapKind) {
    let keep_candidate = match slot {
        None => true,
        Some(current) => match (kind, candidate.compare(current)) {
            (MipmapKind::Min, Some(std::cmp::Ordering::Less)) => true,
            (MipmapKind::Max, Some(std::cmp::Ordering::Greater)) => true,
            _ => false,
        },
    };
    if keep_candidate {
        *slot = Some(candidate.clone());
    }
}

/// One summarization level: the open accumulator plus the level attributes
/// it emits into, one per selected kind.
struct Level {
    accum: ChunkAccum,
    quarks: HashMap<MipmapKind, Quark>,
}

struct Feature {
    base: Quark,
    kinds: Vec<MipmapKind>,
    /// Closed base intervals seen since activation.
    counter: u64,
    levels: Vec<Level>,
    /// Set once the first numeric value arrives and level-1 nodes exist.
    active: bool,
}

pub struct MipmapWriter {
    resolution: u64,
    features: HashMap<Quark, Feature>,
}

impl MipmapWriter {
    pub fn new(resolution: u64) -> Self {
        assert!(resolution >= 2, "mipmap resolution must be at least 2");
        Self {
            resolution,
            features: HashMap::new(),
        }
    }

    /// Select `quark` for summarization under the given kinds. Level nodes
    /// are only created once the attribute sees its first numeric value.
    pub fn register(&mut self, quark: Quark, kinds: &[MipmapKind]) {
        self.features.entry(quark).or_insert_with(|| Feature {
            base: quark,
            kinds: kinds.to_vec(),
            counter: 0,
            levels: Vec::new(),
            active: false,
        });
    }

    pub fn is_registered(&self, quark: Quark) -> bool {
        self.features.contains_key(&quark)
    }

    /// Forward a state change to the state system and fold the interval it
    /// closes into the summary levels.
    pub fn modify_attribute(
        &mut self,
        ss: &StateSystem,
        ts: i64,
        value: StateValue,
        quark: Quark,
    ) -> Result<()> {
        let Some(feature) = self.features.get_mut(&quark) else {
            return ss.modify_attribute(ts, value, quark);
        };
        let prev = ss.query_ongoing_state(quark)?;
        let prev_start = ss.ongoing_start_time(quark)?;
        ss.modify_attribute(ts, value.clone(), quark)?;

        if feature.active && ts > prev_start {
            feed(ss, self.resolution, feature, prev_start, ts - 1, &prev)?;
        }
        if !feature.active && value.is_numeric() {
            activate(ss, feature, ts)?;
        }
        Ok(())
    }

    /// Flush every open accumulator so `close_history(end_ts)` emits a final
    /// interval per level with nothing silently dropped at the tail.
    pub fn close(&mut self, ss: &StateSystem, end_ts: i64) -> Result<()> {
        for (quark, feature) in self.features.iter_mut() {
            if !feature.active {
                continue;
            }
            // The base attribute's still-ongoing interval belongs to the
            // level-1 tail.
            let value = ss.query_ongoing_state(*quark)?;
            let start = ss.ongoing_start_time(*quark)?;
            if end_ts >= start {
                feature.levels[0].accum.absorb_interval(start, end_ts, &value);
            }
            // Carry each level's residue upward so every level covers the
            // history through end_ts, then surface the partials as the
            // ongoing values the close will freeze.
            for i in 0..feature.levels.len() {
                if i + 1 < feature.levels.len() {
                    let residue = feature.levels[i].accum.clone();
                    feature.levels[i + 1].accum.absorb_chunk(&residue);
                }
                set_level_ongoing(ss, &feature.levels[i], &feature.kinds)?;
            }
        }
        Ok(())
    }
}

/// Create the level-1 nodes, anchored at `ts` so their interval timelines
/// line up with the first summarized base interval.
fn activate(ss: &StateSystem, feature: &mut Feature, ts: i64) -> Result<()> {
    let level = new_level(ss, feature, 1, ts)?;
    feature.levels.push(level);
    feature.counter = 0;
    feature.active = true;
    Ok(())
}

fn new_level(ss: &StateSystem, feature: &Feature, level_no: usize, start: i64) -> Result<Level> {
    let mut quarks = HashMap::new();
    for kind in &feature.kinds {
        let q = ss
            .attributes()
            .quark_relative_and_add(feature.base, &[kind.dir(), &kind.node(level_no)]);
        // Close the pre-summary span as Null so the first real chunk starts
        // exactly where its data does.
        ss.modify_attribute(start, StateValue::Null, q)?;
        quarks.insert(*kind, q);
    }
    Ok(Level {
        accum: ChunkAccum::new(start),
        quarks,
    })
}

/// Fold one closed base interval into level 1 and run the carry chain.
fn feed(
    ss: &StateSystem,
    resolution: u64,
    feature: &mut Feature,
    start: i64,
    end: i64,
    value: &StateValue,
) -> Result<()> {
    feature.counter += 1;
    feature.levels[0].accum.absorb_interval(start, end, value);
    set_level_ongoing(ss, &feature.levels[0], &feature.kinds)?;

    let mut level = 0;
    let mut checkpoint = resolution;
    while feature.counter % checkpoint == 0 {
        close_level_chunk(ss, feature, level, end + 1)?;
        level += 1;
        match checkpoint.checked_mul(resolution) {
            Some(next) => checkpoint = next,
            None => break,
        }
    }
    Ok(())
}

/// Emit the finished chunk at `level` as closed intervals ending at
/// `boundary - 1`, fold it into the next level up, and reset the
/// accumulator for the chunk starting at `boundary`.
fn close_level_chunk(
    ss: &StateSystem,
    feature: &mut Feature,
    level: usize,
    boundary: i64,
) -> Result<()> {
    let finished = feature.levels[level].accum.clone();
    for kind in &feature.kinds {
        let q = feature.levels[level].quarks[kind];
        ss.update_ongoing_state(finished.value_for(*kind), q)?;
        ss.modify_attribute(boundary, StateValue::Null, q)?;
    }
    feature.levels[level].accum = ChunkAccum::new(boundary);

    if feature.levels.len() == level + 1 {
        // First promotion out of this level: the coarser level starts where
        // the finished chunk did.
        let next = new_level(ss, feature, level + 2, finished.start)?;
        feature.levels.push(next);
    }
    feature.levels[level + 1].accum.absorb_chunk(&finished);
    set_level_ongoing(ss, &feature.levels[level + 1], &feature.kinds)?;
    Ok(())
}

fn set_level_ongoing(ss: &StateSystem, level: &Level, kinds: &[MipmapKind]) -> Result<()> {
    for kind in kinds {
        ss.update_ongoing_state(level.accum.value_for(*kind), level.quarks[kind])?;
    }
    Ok(())
}

/// Quarks of the existing summary levels for `quark` and `kind`, finest
/// first. Empty when the attribute has no mipmap.
fn level_quarks(ss: &StateSystem, quark: Quark, kind: MipmapKind) -> Vec<Quark> {
    match ss.attributes().quark_relative(quark, &[kind.dir()]) {
        Ok(dir) => ss.attributes().sub_attributes(dir, false),
        Err(_) => Vec::new(),
    }
}

/// Range maximum over `[t1, t2]`, using the coarsest fully-contained level
/// interval at each step and falling back to base intervals at the edges.
pub fn query_range_max(ss: &StateSystem, quark: Quark, t1: i64, t2: i64) -> Result<StateValue> {
    extremum(ss, quark, t1, t2, MipmapKind::Max)
}

/// Range minimum over `[t1, t2]`.
pub fn query_range_min(ss: &StateSystem, quark: Quark, t1: i64, t2: i64) -> Result<StateValue> {
    extremum(ss, quark, t1, t2, MipmapKind::Min)
}

fn extremum(
    ss: &StateSystem,
    quark: Quark,
    t1: i64,
    t2: i64,
    kind: MipmapKind,
) -> Result<StateValue> {
    if t1 == t2 {
        return Ok(ss.query_single_state(t1, quark)?.value);
    }
    let levels = level_quarks(ss, quark, kind);
    let mut best: Option<StateValue> = None;
    let mut cur = t1;
    'walk: while cur <= t2 {
        // Prefer the coarsest level whose interval is fully inside the
        // query range; each hop replaces resolution^level base lookups.
        for lq in levels.iter().rev() {
            if let Ok(iv) = ss.query_single_state(cur, *lq) {
                if iv.start >= cur && iv.end <= t2 && !iv.value.is_null() {
                    merge_extreme(&mut best, &iv.value, kind);
                    cur = iv.end + 1;
                    continue 'walk;
                }
            }
        }
        let iv = ss.query_single_state(cur, quark)?;
        if !iv.value.is_null() {
            merge_extreme(&mut best, &iv.value, kind);
        }
        cur = iv.end + 1;
    }
    Ok(best.unwrap_or(StateValue::Null))
}

/// Time-weighted average over `[t1, t2]`. Partially-covered chunks at either
/// edge are resolved at the base level, so only the overlapping duration
/// contributes. Null spans weigh zero.
pub fn query_range_average(ss: &StateSystem, quark: Quark, t1: i64, t2: i64) -> Result<f64> {
    if t1 == t2 {
        return ss.query_single_state(t1, quark)?.value.to_f64();
    }
    let levels = level_quarks(ss, quark, MipmapKind::Avg);
    let mut sum = 0.0;
    let mut cur = t1;
    'walk: while cur <= t2 {
        for lq in levels.iter().rev() {
            if let Ok(iv) = ss.query_single_state(cur, *lq) {
                if iv.start >= cur && iv.end <= t2 {
                    if let StateValue::Double(avg) = iv.value {
                        sum += avg * iv.duration() as f64;
                        cur = iv.end + 1;
                        continue 'walk;
                    }
                }
            }
        }
        let iv = ss.query_single_state(cur, quark)?;
        let stop = iv.end.min(t2);
        sum += iv.value.to_f64()? * (stop - cur + 1) as f64;
        cur = stop + 1;
    }
    Ok(sum / (t2 - t1 + 1) as f64)
}
