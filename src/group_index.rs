//! Dense level indices for categorical groupings.
//!
//! A [`GroupIndex`] maps every observation to a zero-based, contiguous level.
//! The label ↔ index dictionary is not kept: callers that need labels build
//! the index themselves and keep their own dictionary.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use crate::error::{EngineError, EngineResult};

/// Dense level index of one grouping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupIndex {
    ids: Vec<usize>,
    n_levels: usize,
}

impl GroupIndex {
    /// Factorize arbitrary labels; levels are numbered in order of first
    /// appearance.
    pub fn from_labels<T: Hash + Eq>(labels: &[T]) -> Self {
        let mut dict: HashMap<&T, usize> = HashMap::new();
        let ids = labels
            .iter()
            .map(|label| {
                let next = dict.len();
                *dict.entry(label).or_insert(next)
            })
            .collect();
        Self {
            ids,
            n_levels: dict.len(),
        }
    }

    /// Build from integer codes. Sparse codes are compacted to `0..L` keeping
    /// their relative order, so already-dense codes are left unchanged.
    pub fn from_codes(codes: &[usize]) -> Self {
        let max = codes.iter().copied().max().unwrap_or(0);
        let mut seen = vec![false; max + 1];
        for &c in codes {
            seen[c] = true;
        }
        let mut remap = vec![usize::MAX; max + 1];
        let mut n_levels = 0;
        for (code, &present) in seen.iter().enumerate() {
            if present {
                remap[code] = n_levels;
                n_levels += 1;
            }
        }
        Self {
            ids: codes.iter().map(|&c| remap[c]).collect(),
            n_levels,
        }
    }

    /// Dense index over the observed `(a, b)` pairs. Unobserved combinations
    /// never get a level.
    pub fn combine(a: &GroupIndex, b: &GroupIndex) -> EngineResult<Self> {
        if a.len() != b.len() {
            return Err(EngineError::InvalidDesign(format!(
                "cannot combine groupings of length {} and {}",
                a.len(),
                b.len()
            )));
        }
        let mut dict: HashMap<(usize, usize), usize> = HashMap::new();
        let ids = a
            .ids
            .iter()
            .zip(&b.ids)
            .map(|(&ga, &gb)| {
                let next = dict.len();
                *dict.entry((ga, gb)).or_insert(next)
            })
            .collect();
        Ok(Self {
            ids,
            n_levels: dict.len(),
        })
    }

    /// Fails with [`EngineError::DegenerateGrouping`] when the grouping has a
    /// single level.
    pub fn ensure_not_degenerate(&self, name: &str) -> EngineResult<()> {
        if self.n_levels <= 1 {
            return Err(EngineError::DegenerateGrouping {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    #[inline]
    pub fn ids(&self) -> &[usize] {
        &self.ids
    }

    #[inline]
    pub fn n_levels(&self) -> usize {
        self.n_levels
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of observations per level.
    pub fn counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.n_levels];
        for &g in &self.ids {
            counts[g] += 1;
        }
        counts
    }

    /// Keep the observations flagged in `mask` and re-densify the levels.
    pub fn subset(&self, mask: &[bool]) -> Self {
        let kept: Vec<usize> = self
            .ids
            .iter()
            .zip(mask)
            .filter_map(|(&g, &keep)| keep.then_some(g))
            .collect();
        Self::from_codes(&kept)
    }
}

/// Flag observations that are alone in their level of some grouping.
///
/// Removing an observation can create new singletons in another grouping, so
/// the scan repeats until the set of kept observations stops shrinking.
pub fn detect_singletons(groupings: &[&[usize]]) -> Vec<bool> {
    let n_samples = groupings.first().map_or(0, |g| g.len());
    if n_samples == 0 {
        return Vec::new();
    }

    let max_level = groupings
        .iter()
        .flat_map(|g| g.iter().copied())
        .max()
        .unwrap_or(0);
    let mut counts = vec![0u32; max_level + 1];

    let mut non_singletons: Vec<usize> = (0..n_samples).collect();

    loop {
        let n_before = non_singletons.len();

        for col in groupings {
            counts.iter_mut().for_each(|c| *c = 0);

            // +1 when a level is first seen, -1 when it gets a second member
            let mut n_singletons: i64 = 0;
            for &idx in &non_singletons {
                let e = col[idx];
                let c = counts[e];
                n_singletons += (c == 0) as i64 - (c == 1) as i64;
                counts[e] += 1;
            }

            if n_singletons == 0 {
                continue;
            }
            non_singletons.retain(|&idx| counts[col[idx]] != 1);
        }

        if non_singletons.len() == n_before {
            break;
        }
    }

    let mut is_singleton = vec![true; n_samples];
    for &idx in &non_singletons {
        is_singleton[idx] = false;
    }
    is_singleton
}

/// Whether every level of `inner` maps to a single level of `outer`.
#[inline]
pub fn is_nested_within(inner: &[usize], outer: &[usize]) -> bool {
    let mut first_outer: HashMap<usize, usize> = HashMap::new();
    for (&fv, &cl) in inner.iter().zip(outer) {
        match first_outer.entry(fv) {
            Entry::Vacant(e) => {
                e.insert(cl);
            }
            Entry::Occupied(e) => {
                if *e.get() != cl {
                    return false;
                }
            }
        }
    }
    true
}

/// Which fixed effects are nested in at least one cluster variable.
///
/// A fixed effect that is itself used as a cluster counts as nested. Returns
/// the mask over `fixef_names` and the number of nested fixed effects.
pub fn count_fixef_fully_nested(
    fixef_names: &[String],
    fixef_ids: &[&[usize]],
    cluster_names: &[String],
    cluster_ids: &[&[usize]],
) -> (Vec<bool>, usize) {
    let cluster_name_set: HashSet<&String> = cluster_names.iter().collect();

    let mask: Vec<bool> = fixef_names
        .iter()
        .zip(fixef_ids)
        .map(|(name, &fe)| {
            cluster_name_set.contains(name)
                || cluster_ids
                    .iter()
                    .any(|&cluster| is_nested_within(fe, cluster))
        })
        .collect();
    let count = mask.iter().filter(|&&m| m).count();
    (mask, count)
}

/// Number of connected components of the graph whose nodes are the levels of
/// all `groupings` and whose edges are observations.
///
/// Two intercept groupings identify their levels up to one shared constant
/// exactly when this is 1.
pub fn connected_components(groupings: &[&GroupIndex]) -> usize {
    if groupings.is_empty() {
        return 0;
    }
    let mut offsets = Vec::with_capacity(groupings.len());
    let mut total = 0;
    for g in groupings {
        offsets.push(total);
        total += g.n_levels();
    }

    let mut parent: Vec<usize> = (0..total).collect();
    fn find(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    let n = groupings[0].len();
    for i in 0..n {
        let root = find(&mut parent, offsets[0] + groupings[0].ids()[i]);
        for (q, g) in groupings.iter().enumerate().skip(1) {
            let other = find(&mut parent, offsets[q] + g.ids()[i]);
            if other != root {
                parent[other] = root;
            }
        }
    }

    (0..total)
        .filter(|&x| find(&mut parent, x) == x)
        .count()
}
