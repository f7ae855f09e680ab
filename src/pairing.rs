use anyhow::{anyhow, bail, Result};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::agent::{population_ids, Agent, AgentId};

/// Population of the `index`-th participant (0-based) when populations are
/// filled in arrival order. Populations are numbered from 1.
pub fn population_for(index: usize, population_size: usize) -> u32 {
    (index / population_size.max(1)) as u32 + 1
}

/// Random groups of `group_size` drawn independently inside every population.
///
/// Each population is shuffled and cut into consecutive chunks. Returned groups
/// hold agent ids, ordered by population id.
pub fn draw_groups<R: Rng + ?Sized>(
    agents: &[Agent],
    group_size: usize,
    rng: &mut R,
) -> Result<Vec<Vec<AgentId>>> {
    if group_size == 0 {
        bail!("group size must be positive");
    }
    let mut groups = Vec::new();
    for pid in population_ids(agents) {
        let mut members: Vec<AgentId> = agents
            .iter()
            .filter(|a| a.population_id == pid)
            .map(|a| a.id)
            .collect();
        if members.len() % group_size != 0 {
            bail!(
                "population {} has {} members, not divisible into groups of {}",
                pid,
                members.len(),
                group_size
            );
        }
        members.shuffle(rng);
        groups.extend(members.chunks(group_size).map(|c| c.to_vec()));
    }
    Ok(groups)
}

/// Group lookup: `slot_of[agent index] = (group index, position in group)`.
pub fn index_groups(num_agents: usize, groups: &[Vec<AgentId>]) -> Result<Vec<(usize, usize)>> {
    let mut slot_of = vec![None; num_agents];
    for (g, members) in groups.iter().enumerate() {
        for (s, &id) in members.iter().enumerate() {
            let slot = slot_of
                .get_mut(id)
                .ok_or_else(|| anyhow!("agent {} out of range", id))?;
            if slot.is_some() {
                bail!("agent {} appears in more than one group", id);
            }
            *slot = Some((g, s));
        }
    }
    slot_of
        .into_iter()
        .enumerate()
        .map(|(id, s)| s.ok_or_else(|| anyhow!("agent {} has no group", id)))
        .collect()
}
