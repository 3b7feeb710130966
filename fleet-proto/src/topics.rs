//! Topic naming
//!
//! `heartbeat` carries agent -> kernel reports; `ctl/<name>` carries acks and
//! `data/<name>` carries workload commands, kernel -> agent.

pub const HEARTBEAT_TOPIC: &str = "heartbeat";
pub const CTL_PREFIX: &str = "ctl";
pub const DATA_PREFIX: &str = "data";

pub fn ctl_topic(agent_name: &str) -> String {
    format!("{}/{}", CTL_PREFIX, agent_name)
}

pub fn data_topic(agent_name: &str) -> String {
    format!("{}/{}", DATA_PREFIX, agent_name)
}

/// Channel an inbound agent-side message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentChannel<'a> {
    Ctl(&'a str),
    Data(&'a str),
}

/// Split `ctl/<name>` or `data/<name>`; anything else is not an agent channel.
pub fn parse_agent_topic(topic: &str) -> Option<AgentChannel<'_>> {
    let (prefix, name) = topic.split_once('/')?;
    if name.is_empty() {
        return None;
    }
    match prefix {
        CTL_PREFIX => Some(AgentChannel::Ctl(name)),
        DATA_PREFIX => Some(AgentChannel::Data(name)),
        _ => None,
    }
}
