use crate::agents::AgentView;
use crate::models::{ExperimentDesign, HostAssignment, HostId, HostSelector, Liveness, Variant};

/// Hôtes ciblés, triés et dédoublonnés. Une requête ignore les agents Lost.
pub fn resolve_hosts(selector: &HostSelector, agents: &[AgentView]) -> Vec<HostId> {
    let mut hosts: Vec<HostId> = match selector {
        HostSelector::Hosts { hosts } => hosts
            .iter()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect(),
        HostSelector::Query { capabilities, hostname_prefix, .. } => agents
            .iter()
            .filter(|a| a.liveness != Liveness::Lost)
            .filter(|a| capabilities.iter().all(|c| a.record.capabilities.contains(c)))
            .filter(|a| {
                hostname_prefix
                    .as_deref()
                    .map(|p| a.record.hostname.starts_with(p))
                    .unwrap_or(true)
            })
            .map(|a| a.record.host_id.clone())
            .collect(),
    };
    hosts.sort();
    hosts.dedup();
    if let HostSelector::Query { limit: Some(limit), .. } = selector {
        hosts.truncate(*limit);
    }
    hosts
}

/// Split : alternance baseline/candidate sur les hôtes triés. Paired : les deux variantes partout.
pub fn assign(hosts: &[HostId], design: ExperimentDesign) -> Vec<HostAssignment> {
    match design {
        ExperimentDesign::Split => hosts
            .iter()
            .enumerate()
            .map(|(i, host)| HostAssignment {
                host_id: host.clone(),
                variant: if i % 2 == 0 { Variant::Baseline } else { Variant::Candidate },
            })
            .collect(),
        ExperimentDesign::Paired => hosts
            .iter()
            .flat_map(|host| {
                Variant::all().into_iter().map(move |variant| HostAssignment { host_id: host.clone(), variant })
            })
            .collect(),
    }
}
