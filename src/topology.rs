use std::collections::HashMap;

use itertools::Itertools;

use crate::config::TopologyStrategy;
use crate::primitives::NodeId;

/// A node's part in leader assisted gossip.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Role {
    Leader,
    Follower,
}

/// The overlay network topology as seen by the current node.
#[derive(Debug, Clone)]
pub(crate) struct Topology {
    current_node: NodeId,
    // Every node in the cluster, including the current one
    members: Vec<NodeId>,
    leader: NodeId,
    neighbours: Vec<NodeId>,
}

impl Topology {
    /// Creates a topology without neighbours. The leader is `leader` if
    /// given, the lowest member id otherwise.
    pub(crate) fn new(
        current_node: NodeId,
        members: &[NodeId],
        leader: Option<NodeId>,
    ) -> Self {
        let members: Vec<NodeId> = members
            .iter()
            .chain([&current_node])
            .sorted()
            .dedup()
            .cloned()
            .collect();
        // `members` always holds the current node.
        let leader = leader.unwrap_or_else(|| members[0].clone());
        Self {
            current_node,
            members,
            leader,
            neighbours: Vec::new(),
        }
    }

    /// Replaces the neighbours with the ones derived from `raw_topology`.
    /// Assigning the same topology again leaves the result unchanged.
    pub(crate) fn assign(
        &mut self,
        mut raw_topology: HashMap<NodeId, Vec<NodeId>>,
        strategy: TopologyStrategy,
    ) {
        let neighbours = match strategy {
            TopologyStrategy::Provided => raw_topology.remove(&self.current_node).unwrap_or_default(),
            TopologyStrategy::Star if self.role() == Role::Leader => self
                .members
                .iter()
                .chain(raw_topology.keys().sorted())
                .cloned()
                .collect(),
            TopologyStrategy::Star => Vec::new(),
        };
        self.neighbours = neighbours
            .into_iter()
            .filter(|node| *node != self.current_node)
            .unique()
            .collect();
    }

    /// Provides the current node's direct neighbours in the overlay network,
    /// never including the current node itself.
    pub(crate) fn neighbours(&self) -> &[NodeId] {
        &self.neighbours
    }

    pub(crate) fn role(&self) -> Role {
        if self.current_node == self.leader {
            Role::Leader
        } else {
            Role::Follower
        }
    }

    pub(crate) fn leader_id(&self) -> &NodeId {
        &self.leader
    }

    /// The nodes a message seen for the first time from a client is sent to:
    /// all neighbours, plus the leader if this node is a follower.
    pub(crate) fn client_fanout(&self) -> Vec<NodeId> {
        let leader = match self.role() {
            Role::Follower => Some(&self.leader),
            Role::Leader => None,
        };
        self.neighbours
            .iter()
            .chain(leader)
            .unique()
            .cloned()
            .collect()
    }

    /// The nodes a message first seen in a batch from `sender` is passed on
    /// to: all neighbours except the sender.
    pub(crate) fn peer_fanout(
        &self,
        sender: &NodeId,
    ) -> Vec<NodeId> {
        self.neighbours
            .iter()
            .filter(|node| *node != sender)
            .cloned()
            .collect()
    }
}
