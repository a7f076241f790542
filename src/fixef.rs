//! Recovery of per-level fixed-effect coefficients after a fit.
//!
//! The fixed-effect part of the linear predictor, `η − offset − Xβ`, lies in
//! the span of the grouping dummies (and slope interactions). Centering it once
//! more yields level coefficients that reproduce it exactly; they are then
//! normalized so that the first intercept grouping is free and every later
//! intercept grouping has its first level fixed at zero.

use crate::demean::{center_column, CenteringConfig, DemeanContext};
use crate::design::GroupingSpec;
use crate::error::FitWarning;
use crate::group_index::{connected_components, is_nested_within, GroupIndex};

/// Estimated coefficients of one grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedEffectTable {
    pub name: String,
    /// One value per level; the reference level holds an explicit zero.
    pub levels: Vec<f64>,
    /// Level fixed at zero, if any.
    pub reference: Option<usize>,
    /// Values are level-specific slopes rather than intercepts.
    pub is_slope: bool,
}

/// Level coefficients of every grouping, in input order.
pub(crate) fn recover(
    groupings: &[GroupingSpec],
    ctx: &DemeanContext,
    fe_sum: &[f64],
    config: &CenteringConfig,
) -> Vec<FixedEffectTable> {
    let centered = center_column(fe_sum, ctx, config);
    let coef = centered.fe_coefficients.column(0);

    let mut tables: Vec<FixedEffectTable> = groupings
        .iter()
        .zip(ctx.original_layout())
        .map(|(g, (start, n_levels))| FixedEffectTable {
            name: g.name.clone(),
            levels: coef.iter().skip(start).take(n_levels).copied().collect(),
            reference: None,
            is_slope: g.is_slope(),
        })
        .collect();

    normalize(&mut tables);
    tables
}

/// Shift every intercept grouping after the first so its level 0 is zero,
/// moving the constant onto the first intercept grouping.
fn normalize(tables: &mut [FixedEffectTable]) {
    let mut intercepts = tables.iter_mut().filter(|t| !t.is_slope);
    let first = match intercepts.next() {
        Some(t) => t,
        None => return,
    };

    let mut shift = 0.0;
    for table in intercepts {
        let c = table.levels.first().copied().unwrap_or(0.0);
        table.levels.iter_mut().for_each(|v| *v -= c);
        table.reference = Some(0);
        shift += c;
    }
    first.levels.iter_mut().for_each(|v| *v += shift);
}

/// Flag intercept groupings whose levels one reference per grouping cannot
/// pin down: their observation graph is disconnected, or one grouping is
/// nested in another.
pub(crate) fn identification_warning(groupings: &[GroupingSpec]) -> Option<FitWarning> {
    let intercepts: Vec<&GroupingSpec> = groupings.iter().filter(|g| !g.is_slope()).collect();
    if intercepts.len() < 2 {
        return None;
    }

    let indices: Vec<&GroupIndex> = intercepts.iter().map(|g| &g.index).collect();
    let components = connected_components(&indices);
    let nested = intercepts.iter().enumerate().any(|(a, ga)| {
        intercepts
            .iter()
            .enumerate()
            .any(|(b, gb)| a != b && is_nested_within(ga.index.ids(), gb.index.ids()))
    });

    if components <= 1 && !nested {
        return None;
    }
    let names: Vec<String> = intercepts.iter().map(|g| g.name.clone()).collect();
    log::warn!(
        "fixed effects [{}] are underidentified ({components} connected components{})",
        names.join(", "),
        if nested { ", nested groupings" } else { "" }
    );
    Some(FitWarning::UnderidentifiedFixedEffects {
        groupings: names,
        components,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn panel() -> Vec<GroupingSpec> {
        // 3 firms x 2 years
        vec![
            GroupingSpec::new("firm", GroupIndex::from_codes(&[0, 0, 1, 1, 2, 2])),
            GroupingSpec::new("year", GroupIndex::from_codes(&[0, 1, 0, 1, 0, 1])),
        ]
    }

    #[test]
    fn test_recover_two_way_levels() {
        let groupings = panel();
        let firm = [1.0, 2.0, -1.0];
        let year = [0.5, 1.5];
        let fe_sum: Vec<f64> = (0..6)
            .map(|i| firm[groupings[0].index.ids()[i]] + year[groupings[1].index.ids()[i]])
            .collect();

        let ctx = DemeanContext::new(&groupings, None, false).unwrap();
        let tables = recover(&groupings, &ctx, &fe_sum, &CenteringConfig::default());

        assert_eq!(tables[1].reference, Some(0));
        assert_relative_eq!(tables[1].levels[0], 0.0);
        assert_relative_eq!(tables[1].levels[1], 1.0, epsilon = 1e-6);
        for g in 0..3 {
            assert_relative_eq!(tables[0].levels[g], firm[g] + 0.5, epsilon = 1e-6);
        }
        assert_eq!(tables[0].reference, None);
    }

    #[test]
    fn test_slope_groupings_have_no_reference() {
        let index = GroupIndex::from_codes(&[0, 0, 1, 1]);
        let z = vec![1.0, 2.0, 1.0, 3.0];
        let groupings = vec![
            GroupingSpec::new("g", index.clone()),
            GroupingSpec::with_slope("g[z]", index, z.clone()).unwrap(),
        ];
        let fe_sum: Vec<f64> = (0..4)
            .map(|i| [1.0, -1.0][i / 2] + [0.5, 2.0][i / 2] * z[i])
            .collect();

        let ctx = DemeanContext::new(&groupings, None, false).unwrap();
        let tables = recover(&groupings, &ctx, &fe_sum, &CenteringConfig::default());
        assert!(tables[1].is_slope);
        assert_eq!(tables[1].reference, None);
        assert_relative_eq!(tables[1].levels[0], 0.5, epsilon = 1e-6);
        assert_relative_eq!(tables[1].levels[1], 2.0, epsilon = 1e-6);
        assert_relative_eq!(tables[0].levels[1], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_identification_checks() {
        assert!(identification_warning(&panel()).is_none());

        // Two disconnected blocks
        let split = vec![
            GroupingSpec::new("a", GroupIndex::from_codes(&[0, 0, 1, 1])),
            GroupingSpec::new("b", GroupIndex::from_codes(&[0, 1, 2, 3])),
        ];
        let warning = identification_warning(&split);
        assert!(matches!(
            warning,
            Some(FitWarning::UnderidentifiedFixedEffects { components, .. }) if components > 1
        ));

        // b nested in a
        let nested = vec![
            GroupingSpec::new("a", GroupIndex::from_codes(&[0, 0, 1, 1, 0, 1])),
            GroupingSpec::new("b", GroupIndex::from_codes(&[0, 1, 2, 3, 1, 2])),
        ];
        assert!(identification_warning(&nested).is_some());
    }
}
