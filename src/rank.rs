//! Percentile ranking over a frozen population.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct RankedEntity<E> {
    pub entity: E,
    pub raw_count: u64,
    pub percentile: f64,
}

/// Ranks the whole population at once. The sort is stable, so entities with
/// equal counts keep their input order; the result is in ascending count order.
///
/// `percentile = rank / max(n - 1, 1) * 100`, which puts a lone entity at 0.
pub fn rank<E>(population: Vec<(E, u64)>) -> Vec<RankedEntity<E>> {
    let mut population = population;
    population.sort_by_key(|(_, count)| *count);
    let denominator = population.len().saturating_sub(1).max(1) as f64;
    population
        .into_iter()
        .enumerate()
        .map(|(index, (entity, raw_count))| RankedEntity {
            entity,
            raw_count,
            percentile: index as f64 / denominator * 100.0,
        })
        .collect()
}

/// Ranks each group independently. Groups come out in key order, members in
/// ascending count order within their group.
pub fn rank_grouped<G: Ord, E>(population: Vec<(G, E, u64)>) -> Vec<(G, RankedEntity<E>)>
where
    G: Clone,
{
    let mut groups: BTreeMap<G, Vec<(E, u64)>> = BTreeMap::new();
    for (group, entity, count) in population {
        groups.entry(group).or_default().push((entity, count));
    }
    groups
        .into_iter()
        .flat_map(|(group, members)| {
            rank(members)
                .into_iter()
                .map(move |ranked| (group.clone(), ranked))
        })
        .collect()
}
