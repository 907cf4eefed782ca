//! Food-web graph.
//!
//! Species are nodes and predation links point from prey to predator. A web is
//! built once, then shared read-only by every simulation.

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};
use thiserror::Error;

/// Identifier of a species node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised while building or loading a food web.
#[derive(Debug, Error)]
pub enum FoodWebError {
    #[error("node {0} already exists")]
    DuplicateNode(NodeId),

    #[error("node {0} does not exist")]
    NodeAbsent(NodeId),

    #[error("invalid food web document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("food web i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Trophic role of a species.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    #[default]
    Producer,
    Consumer,
}

/// Per-species attributes.
///
/// Every rate is optional; missing values are derived allometrically from
/// `body_mass` and the model constants.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeAttributes {
    pub node_type: NodeType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Body mass relative to the reference producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_mass: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metabolic_rate: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub growth_rate: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrying_capacity: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ingestion_rate: Option<f64>,
}

impl NodeAttributes {
    pub fn new(node_type: NodeType) -> Self {
        Self {
            node_type,
            ..Self::default()
        }
    }
}

/// Directed predation graph with per-node attributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FoodWeb {
    nodes: BTreeMap<NodeId, NodeAttributes>,
    // predator -> prey
    prey: BTreeMap<NodeId, BTreeSet<NodeId>>,
    // prey -> predators
    predators: BTreeMap<NodeId, BTreeSet<NodeId>>,
}

#[derive(Serialize, Deserialize)]
struct NodeEntry {
    id: NodeId,
    #[serde(flatten)]
    attributes: NodeAttributes,
}

#[derive(Serialize, Deserialize)]
struct LinkEntry {
    prey: NodeId,
    predator: NodeId,
}

#[derive(Serialize, Deserialize)]
struct FoodWebDocument {
    nodes: Vec<NodeEntry>,
    #[serde(default)]
    links: Vec<LinkEntry>,
}

impl FoodWeb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with default (producer) attributes.
    pub fn add_node(&mut self, id: NodeId) -> Result<(), FoodWebError> {
        self.add_node_with(id, NodeAttributes::default())
    }

    pub fn add_node_with(
        &mut self,
        id: NodeId,
        attributes: NodeAttributes,
    ) -> Result<(), FoodWebError> {
        if self.nodes.contains_key(&id) {
            return Err(FoodWebError::DuplicateNode(id));
        }
        self.nodes.insert(id, attributes);
        self.prey.insert(id, BTreeSet::new());
        self.predators.insert(id, BTreeSet::new());
        Ok(())
    }

    /// Add a predation link. Both endpoints must already exist.
    pub fn add_link(&mut self, prey: NodeId, predator: NodeId) -> Result<(), FoodWebError> {
        for id in [prey, predator] {
            if !self.nodes.contains_key(&id) {
                return Err(FoodWebError::NodeAbsent(id));
            }
        }
        self.prey.entry(predator).or_default().insert(prey);
        self.predators.entry(prey).or_default().insert(predator);
        Ok(())
    }

    pub fn set_node_attributes(
        &mut self,
        id: NodeId,
        attributes: NodeAttributes,
    ) -> Result<(), FoodWebError> {
        let slot = self.nodes.get_mut(&id).ok_or(FoodWebError::NodeAbsent(id))?;
        *slot = attributes;
        Ok(())
    }

    pub fn node_attributes(&self, id: NodeId) -> Option<&NodeAttributes> {
        self.nodes.get(&id)
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn contains_link(&self, prey: NodeId, predator: NodeId) -> bool {
        self.prey
            .get(&predator)
            .is_some_and(|set| set.contains(&prey))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.prey.values().map(BTreeSet::len).sum()
    }

    /// Node ids in ascending order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Links as `(prey, predator)` pairs.
    pub fn links(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.prey
            .iter()
            .flat_map(|(&predator, prey)| prey.iter().map(move |&prey| (prey, predator)))
    }

    /// Species eaten by `id`. Empty for unknown nodes.
    pub fn prey_of(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.prey.get(&id).cloned().unwrap_or_default()
    }

    /// Species eating `id`. Empty for unknown nodes.
    pub fn predators_of(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.predators.get(&id).cloned().unwrap_or_default()
    }

    /// Build the web induced by `ids`: those nodes and every link between them.
    pub fn subweb(&self, ids: &BTreeSet<NodeId>) -> Result<FoodWeb, FoodWebError> {
        let mut web = FoodWeb::new();
        for &id in ids {
            let attributes = self
                .nodes
                .get(&id)
                .ok_or(FoodWebError::NodeAbsent(id))?;
            web.add_node_with(id, attributes.clone())?;
        }
        for (prey, predator) in self.links() {
            if ids.contains(&prey) && ids.contains(&predator) {
                web.add_link(prey, predator)?;
            }
        }
        Ok(web)
    }

    pub fn from_json_reader<R: Read>(reader: R) -> Result<Self, FoodWebError> {
        let document: FoodWebDocument = serde_json::from_reader(reader)?;

        let mut web = FoodWeb::new();
        for entry in document.nodes {
            web.add_node_with(entry.id, entry.attributes)?;
        }
        for link in document.links {
            web.add_link(link.prey, link.predator)?;
        }
        Ok(web)
    }

    pub fn from_json_str(json: &str) -> Result<Self, FoodWebError> {
        Self::from_json_reader(json.as_bytes())
    }

    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self, FoodWebError> {
        let file = File::open(file.as_ref())?;
        Self::from_json_reader(BufReader::new(file))
    }

    pub fn to_json_writer<W: Write>(&self, writer: W) -> Result<(), FoodWebError> {
        let document = FoodWebDocument {
            nodes: self
                .nodes
                .iter()
                .map(|(&id, attributes)| NodeEntry {
                    id,
                    attributes: attributes.clone(),
                })
                .collect(),
            links: self
                .links()
                .map(|(prey, predator)| LinkEntry { prey, predator })
                .collect(),
        };
        serde_json::to_writer_pretty(writer, &document)?;
        Ok(())
    }

    pub fn to_file<P: AsRef<Path>>(&self, file: P) -> Result<(), FoodWebError> {
        let file = File::create(file.as_ref())?;
        let mut writer = BufWriter::new(file);
        self.to_json_writer(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL_FOOD_WEB: &str = r#"{
        "nodes": [
            { "id": 1, "node_type": "producer" },
            { "id": 2, "node_type": "consumer" },
            { "id": 3, "node_type": "consumer" }
        ],
        "links": [
            { "prey": 1, "predator": 2 },
            { "prey": 1, "predator": 3 },
            { "prey": 2, "predator": 3 }
        ]
    }"#;

    fn ids(values: &[u32]) -> BTreeSet<NodeId> {
        values.iter().copied().map(NodeId).collect()
    }

    fn three_node_web() -> FoodWeb {
        let mut web = FoodWeb::new();
        web.add_node_with(NodeId(1), NodeAttributes::new(NodeType::Producer))
            .unwrap();
        web.add_node_with(NodeId(2), NodeAttributes::new(NodeType::Consumer))
            .unwrap();
        web.add_node_with(NodeId(3), NodeAttributes::new(NodeType::Consumer))
            .unwrap();
        web.add_link(NodeId(1), NodeId(2)).unwrap();
        web.add_link(NodeId(1), NodeId(3)).unwrap();
        web.add_link(NodeId(2), NodeId(3)).unwrap();
        web
    }

    #[test]
    fn empty_web_has_no_nodes() {
        assert_eq!(FoodWeb::new().node_count(), 0);
    }

    #[test]
    fn node_count_matches_added_nodes() {
        let mut web = FoodWeb::new();
        for id in 1..=3 {
            web.add_node(NodeId(id)).unwrap();
        }
        assert_eq!(web.node_count(), 3);
        assert_eq!(web.nodes().collect::<BTreeSet<_>>(), ids(&[1, 2, 3]));
    }

    #[test]
    fn link_to_absent_node_is_rejected() {
        let mut web = FoodWeb::new();
        let err = web.add_link(NodeId(1), NodeId(2)).unwrap_err();
        assert!(matches!(err, FoodWebError::NodeAbsent(NodeId(1))));

        web.add_node(NodeId(1)).unwrap();
        let err = web.add_link(NodeId(1), NodeId(2)).unwrap_err();
        assert!(matches!(err, FoodWebError::NodeAbsent(NodeId(2))));
        assert_eq!(web.link_count(), 0);
    }

    #[test]
    fn duplicate_node_is_rejected() {
        let mut web = FoodWeb::new();
        web.add_node(NodeId(1)).unwrap();
        let err = web.add_node(NodeId(1)).unwrap_err();
        assert!(matches!(err, FoodWebError::DuplicateNode(NodeId(1))));
        assert_eq!(web.node_count(), 1);
    }

    #[test]
    fn added_link_is_visible_from_both_ends() {
        let web = three_node_web();
        for (prey, predator) in [(1, 2), (1, 3), (2, 3)] {
            let (prey, predator) = (NodeId(prey), NodeId(predator));
            assert!(web.contains_link(prey, predator));
            assert!(web.prey_of(predator).contains(&prey));
            assert!(web.predators_of(prey).contains(&predator));
        }
        assert!(!web.contains_link(NodeId(3), NodeId(1)));
        assert_eq!(web.link_count(), 3);
    }

    #[test]
    fn prey_and_predator_queries() {
        let web = three_node_web();
        assert_eq!(web.prey_of(NodeId(3)), ids(&[1, 2]));
        assert_eq!(web.predators_of(NodeId(1)), ids(&[2, 3]));
        assert!(web.prey_of(NodeId(1)).is_empty());
        assert!(web.predators_of(NodeId(42)).is_empty());
    }

    #[test]
    fn node_attributes_can_be_replaced() {
        let mut web = FoodWeb::new();
        web.add_node(NodeId(1)).unwrap();
        let attributes = NodeAttributes {
            body_mass: Some(10.0),
            ..NodeAttributes::new(NodeType::Consumer)
        };
        web.set_node_attributes(NodeId(1), attributes.clone())
            .unwrap();
        assert_eq!(web.node_attributes(NodeId(1)), Some(&attributes));

        let err = web
            .set_node_attributes(NodeId(7), attributes)
            .unwrap_err();
        assert!(matches!(err, FoodWebError::NodeAbsent(NodeId(7))));
    }

    #[test]
    fn json_document_matches_direct_construction() {
        let web = three_node_web();
        let json_web = FoodWeb::from_json_str(SMALL_FOOD_WEB).unwrap();

        assert_eq!(web.nodes().collect::<Vec<_>>(), json_web.nodes().collect::<Vec<_>>());
        for id in web.nodes() {
            assert_eq!(web.prey_of(id), json_web.prey_of(id));
            assert_eq!(web.predators_of(id), json_web.predators_of(id));
            assert_eq!(web.node_attributes(id), json_web.node_attributes(id));
        }
        assert_eq!(web, json_web);
    }

    #[test]
    fn json_round_trip_keeps_attributes() {
        let mut web = three_node_web();
        web.set_node_attributes(
            NodeId(2),
            NodeAttributes {
                name: Some("grazer".to_string()),
                body_mass: Some(12.5),
                ..NodeAttributes::new(NodeType::Consumer)
            },
        )
        .unwrap();

        let mut buffer = Vec::new();
        web.to_json_writer(&mut buffer).unwrap();
        let reloaded = FoodWeb::from_json_reader(buffer.as_slice()).unwrap();
        assert_eq!(web, reloaded);
    }

    #[test]
    fn saved_file_loads_back() {
        let dir = std::env::temp_dir().join(format!("atnsim-foodweb-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("web.json");

        let web = three_node_web();
        web.to_file(&file).unwrap();
        assert_eq!(FoodWeb::from_file(&file).unwrap(), web);

        assert!(matches!(
            FoodWeb::from_file(dir.join("missing.json")),
            Err(FoodWebError::Io(_))
        ));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn malformed_documents_are_rejected() {
        let dangling = r#"{ "nodes": [ { "id": 1, "node_type": "producer" } ],
                           "links": [ { "prey": 1, "predator": 9 } ] }"#;
        assert!(matches!(
            FoodWeb::from_json_str(dangling),
            Err(FoodWebError::NodeAbsent(NodeId(9)))
        ));

        let duplicate = r#"{ "nodes": [ { "id": 4, "node_type": "producer" },
                                        { "id": 4, "node_type": "consumer" } ] }"#;
        assert!(matches!(
            FoodWeb::from_json_str(duplicate),
            Err(FoodWebError::DuplicateNode(NodeId(4)))
        ));

        assert!(matches!(
            FoodWeb::from_json_str("{ \"nodes\": 3 }"),
            Err(FoodWebError::Json(_))
        ));
    }

    #[test]
    fn subweb_keeps_induced_links_only() {
        let web = three_node_web();
        let sub = web.subweb(&ids(&[1, 3])).unwrap();
        assert_eq!(sub.node_count(), 2);
        assert!(sub.contains_link(NodeId(1), NodeId(3)));
        assert!(!sub.contains_node(NodeId(2)));
        assert_eq!(sub.prey_of(NodeId(3)), ids(&[1]));

        assert!(matches!(
            web.subweb(&ids(&[1, 5])),
            Err(FoodWebError::NodeAbsent(NodeId(5)))
        ));
    }
}
