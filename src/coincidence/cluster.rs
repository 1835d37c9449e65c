use crate::error::{Result, TriggerError};
use crate::registry::ChannelRegistry;
use crate::types::ChannelId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy)]
struct Entry {
    time: i64,
    channel: ChannelId,
    /// Position in the channel's original candidate list
    index: usize,
}

/// One accepted coincidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Delay-corrected time of the seed
    pub seed_time: i64,
    pub seed_channel: ChannelId,
    /// Distinct channels, ascending
    pub channels: Vec<ChannelId>,
    pub members: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterOutcome {
    /// Accept bits aligned to each channel's original candidate order
    pub decisions: Vec<Vec<bool>>,
    pub clusters: Vec<Cluster>,
}

impl ClusterOutcome {
    pub fn accepted(&self) -> usize {
        self.decisions
            .iter()
            .map(|d| d.iter().filter(|&&accept| accept).count())
            .sum()
    }
}

/// Greedy left-to-right clustering of delay-corrected candidate times.
///
/// `candidates[ch]` holds the local sample times reported by channel `ch`.
/// Each not-yet-consumed candidate in time order seeds a cluster that takes
/// every later candidate within the seed's pairwise window. A cluster with at
/// least `multiplicity` distinct channels is accepted whole and the sweep
/// continues after its last member; otherwise only the seed is rejected and
/// the next candidate becomes the seed.
pub fn find_coincidences(
    registry: &ChannelRegistry,
    candidates: &[Vec<i64>],
    multiplicity: usize,
) -> Result<ClusterOutcome> {
    let channels = candidates.len();
    if channels != registry.len() {
        return Err(TriggerError::InvalidConfig(format!(
            "{} candidate lists for {} registered channels",
            channels,
            registry.len()
        )));
    }

    let mut entries: Vec<Entry> = candidates
        .iter()
        .enumerate()
        .flat_map(|(channel, times)| {
            times.iter().enumerate().map(move |(index, &t)| Entry {
                time: registry.correct(channel, t),
                channel,
                index,
            })
        })
        .collect();
    // Stable: equal (time, channel) keep their original order
    entries.sort_by_key(|e| (e.time, e.channel));

    let mut decisions: Vec<Vec<bool>> = candidates.iter().map(|c| vec![false; c.len()]).collect();
    let mut clusters = Vec::new();
    let mut present = vec![false; channels];
    let mut members: Vec<usize> = Vec::new();

    let mut seed = 0;
    while seed < entries.len() {
        let s = entries[seed];
        let horizon = registry.horizon(s.channel);

        present.iter_mut().for_each(|p| *p = false);
        members.clear();
        members.push(seed);
        present[s.channel] = true;
        let mut distinct = 1;

        let mut j = seed + 1;
        while j < entries.len() {
            let e = entries[j];
            let dt = e.time - s.time;
            if dt > horizon {
                break;
            }
            if dt <= registry.window(s.channel, e.channel) {
                members.push(j);
                if !present[e.channel] {
                    present[e.channel] = true;
                    distinct += 1;
                }
            }
            j += 1;
        }

        if distinct >= multiplicity.max(1) {
            for &m in &members {
                let e = entries[m];
                decisions[e.channel][e.index] = true;
            }
            clusters.push(Cluster {
                seed_time: s.time,
                seed_channel: s.channel,
                channels: (0..channels).filter(|&ch| present[ch]).collect(),
                members: members.len(),
            });
            // members is ascending, so the last one ends the cluster
            seed = members.last().copied().unwrap_or(seed) + 1;
        } else {
            seed += 1;
        }
    }

    log::debug!(
        "Clustering: {} candidates, {} cluster(s) accepted at multiplicity {}",
        entries.len(),
        clusters.len(),
        multiplicity
    );

    Ok(ClusterOutcome {
        decisions,
        clusters,
    })
}
