//! Bioenergetic consumer-resource equations of the allometric trophic network.

use crate::config::{ExtinctionPolicy, ModelConstants};
use crate::foodweb::{FoodWeb, NodeId, NodeType};
use crate::system::Equations;
use serde::{Deserialize, Serialize};

/// Rates of one species after allometric scaling and attribute overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesParameters {
    pub id: NodeId,
    pub node_type: NodeType,
    pub body_mass: f64,
    pub metabolic_rate: f64,
    /// Zero for consumers.
    pub growth_rate: f64,
    pub carrying_capacity: f64,
    /// Zero for producers.
    pub max_ingestion_rate: f64,
}

/// Everything needed to reproduce a run of [`AtnEquations`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtnParameters {
    pub constants: ModelConstants,
    /// One entry per state-vector slot, in ascending node-id order.
    pub species: Vec<SpeciesParameters>,
}

impl AtnParameters {
    /// Node id of every state-vector slot.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.species.iter().map(|sp| sp.id).collect()
    }
}

#[derive(Debug, Clone)]
struct Feeding {
    prey: usize,
    preference: f64,
    efficiency: f64,
}

/// ATN equations bound to one food web.
///
/// State-vector slot `i` holds the biomass of the `i`-th node in ascending
/// id order.
#[derive(Debug, Clone)]
pub struct AtnEquations {
    parameters: AtnParameters,
    // Indexed by predator slot; empty for producers.
    diets: Vec<Vec<Feeding>>,
    response_exponent: f64,
    half_saturation_term: f64,
}

impl AtnEquations {
    pub fn new(web: &FoodWeb, constants: &ModelConstants) -> Self {
        let ids: Vec<NodeId> = web.nodes().collect();
        let slot_of = |id: NodeId| ids.binary_search(&id).ok();

        let species: Vec<SpeciesParameters> = ids
            .iter()
            .map(|&id| species_parameters(web, id, constants))
            .collect();

        let diets = species
            .iter()
            .map(|sp| {
                if sp.node_type == NodeType::Producer {
                    return Vec::new();
                }
                let prey: Vec<usize> = web.prey_of(sp.id).into_iter().filter_map(slot_of).collect();
                let preference = 1.0 / prey.len().max(1) as f64;
                prey.into_iter()
                    .map(|j| Feeding {
                        prey: j,
                        preference,
                        efficiency: match species[j].node_type {
                            NodeType::Producer => constants.producer_assimilation_efficiency,
                            NodeType::Consumer => constants.consumer_assimilation_efficiency,
                        },
                    })
                    .collect()
            })
            .collect();

        let response_exponent = 1.0 + constants.functional_response_control;
        let half_saturation_term = constants.half_saturation.powf(response_exponent);

        Self {
            parameters: AtnParameters {
                constants: constants.clone(),
                species,
            },
            diets,
            response_exponent,
            half_saturation_term,
        }
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.parameters.node_ids()
    }

    pub fn species(&self) -> &[SpeciesParameters] {
        &self.parameters.species
    }

    fn interacting(&self, biomass: f64) -> f64 {
        if biomass < self.parameters.constants.extinction_threshold || biomass <= 0.0 {
            0.0
        } else {
            biomass
        }
    }
}

fn species_parameters(web: &FoodWeb, id: NodeId, c: &ModelConstants) -> SpeciesParameters {
    let attributes = web.node_attributes(id).cloned().unwrap_or_default();
    let body_mass = attributes.body_mass.unwrap_or(c.reference_body_mass);
    let coefficient = match attributes.node_type {
        NodeType::Producer => c.producer_metabolic_coefficient,
        NodeType::Consumer => c.consumer_metabolic_coefficient,
    };
    let metabolic_rate = attributes.metabolic_rate.unwrap_or_else(|| {
        coefficient * (body_mass / c.reference_body_mass).powf(c.metabolic_exponent)
    });

    let (growth_rate, max_ingestion_rate) = match attributes.node_type {
        NodeType::Producer => (attributes.growth_rate.unwrap_or(c.growth_rate), 0.0),
        NodeType::Consumer => (
            0.0,
            attributes
                .max_ingestion_rate
                .unwrap_or(c.max_ingestion_rate),
        ),
    };

    SpeciesParameters {
        id,
        node_type: attributes.node_type,
        body_mass,
        metabolic_rate,
        growth_rate,
        carrying_capacity: attributes
            .carrying_capacity
            .unwrap_or(c.carrying_capacity),
        max_ingestion_rate,
    }
}

impl Equations for AtnEquations {
    type Parameters = AtnParameters;

    fn dimension(&self) -> usize {
        self.parameters.species.len()
    }

    fn derivative(&self, _t: f64, biomass: &[f64], out: &mut [f64]) {
        let species = &self.parameters.species;

        // Growth of producers and metabolic loss of consumers.
        for (i, sp) in species.iter().enumerate() {
            let b = biomass[i];
            out[i] = match sp.node_type {
                NodeType::Producer => sp.growth_rate * b * (1.0 - b / sp.carrying_capacity),
                NodeType::Consumer => -sp.metabolic_rate * b,
            };
        }

        // Predation, with extinct species contributing nothing.
        let interference = self.parameters.constants.predator_interference;
        for (i, diet) in self.diets.iter().enumerate() {
            if diet.is_empty() {
                continue;
            }
            let predator = self.interacting(biomass[i]);
            if predator == 0.0 {
                continue;
            }

            let mut denominator = self.half_saturation_term * (1.0 + interference * predator);
            for feeding in diet {
                let prey = self.interacting(biomass[feeding.prey]);
                denominator += feeding.preference * prey.powf(self.response_exponent);
            }

            let sp = &species[i];
            let intake_scale = sp.metabolic_rate * sp.max_ingestion_rate * predator / denominator;
            for feeding in diet {
                let prey = self.interacting(biomass[feeding.prey]);
                let intake = intake_scale * feeding.preference * prey.powf(self.response_exponent);
                out[i] += intake;
                out[feeding.prey] -= intake / feeding.efficiency;
            }
        }
    }

    fn extinction_threshold(&self) -> f64 {
        self.parameters.constants.extinction_threshold
    }

    fn extinction_policy(&self) -> ExtinctionPolicy {
        self.parameters.constants.extinction_policy
    }

    fn parameters(&self) -> AtnParameters {
        self.parameters.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foodweb::NodeAttributes;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-12 * b.abs().max(1.0)
    }

    fn producer_consumer_web() -> FoodWeb {
        let mut web = FoodWeb::new();
        web.add_node_with(NodeId(1), NodeAttributes::new(NodeType::Producer))
            .unwrap();
        web.add_node_with(NodeId(2), NodeAttributes::new(NodeType::Consumer))
            .unwrap();
        web.add_link(NodeId(1), NodeId(2)).unwrap();
        web
    }

    fn linear_constants() -> ModelConstants {
        ModelConstants {
            carrying_capacity: 10.0,
            half_saturation: 1.0,
            functional_response_control: 0.0,
            ..ModelConstants::default()
        }
    }

    #[test]
    fn lone_producer_grows_logistically() {
        let mut web = FoodWeb::new();
        web.add_node(NodeId(5)).unwrap();
        let constants = linear_constants();
        let equations = AtnEquations::new(&web, &constants);

        assert_eq!(equations.dimension(), 1);
        let mut out = [0.0];
        equations.derivative(0.0, &[5.0], &mut out);
        assert!(close(out[0], 1.0 * 5.0 * 0.5));

        equations.derivative(0.0, &[10.0], &mut out);
        assert_eq!(out[0], 0.0);
    }

    #[test]
    fn predation_moves_biomass_from_prey_to_predator() {
        let constants = linear_constants();
        let equations = AtnEquations::new(&producer_consumer_web(), &constants);
        let mut out = [0.0; 2];
        equations.derivative(0.0, &[4.0, 2.0], &mut out);

        let x = constants.consumer_metabolic_coefficient;
        let y = constants.max_ingestion_rate;
        let f = 4.0 / (1.0 + 4.0);
        let intake = x * y * 2.0 * f;
        let growth = 4.0 * (1.0 - 4.0 / 10.0);

        assert!(close(out[1], -x * 2.0 + intake));
        assert!(close(
            out[0],
            growth - intake / constants.producer_assimilation_efficiency
        ));
    }

    #[test]
    fn extinct_species_do_not_interact() {
        let constants = linear_constants();
        let equations = AtnEquations::new(&producer_consumer_web(), &constants);
        let mut out = [0.0; 2];

        // Predator below threshold: prey only grows, predator only decays.
        let tiny = constants.extinction_threshold / 2.0;
        equations.derivative(0.0, &[4.0, tiny], &mut out);
        assert!(close(out[0], 4.0 * 0.6));
        assert!(close(out[1], -constants.consumer_metabolic_coefficient * tiny));

        // Prey below threshold: it keeps its own growth term and is not eaten.
        equations.derivative(0.0, &[tiny, 2.0], &mut out);
        assert!(out[0] > 0.0);
        assert!(close(out[1], -constants.consumer_metabolic_coefficient * 2.0));
    }

    #[test]
    fn rates_follow_body_mass_and_overrides() {
        let mut web = producer_consumer_web();
        web.set_node_attributes(
            NodeId(2),
            NodeAttributes {
                body_mass: Some(16.0),
                ..NodeAttributes::new(NodeType::Consumer)
            },
        )
        .unwrap();
        web.set_node_attributes(
            NodeId(1),
            NodeAttributes {
                growth_rate: Some(0.5),
                carrying_capacity: Some(42.0),
                ..NodeAttributes::new(NodeType::Producer)
            },
        )
        .unwrap();

        let constants = ModelConstants::default();
        let equations = AtnEquations::new(&web, &constants);
        let species = equations.species();

        assert_eq!(equations.node_ids(), vec![NodeId(1), NodeId(2)]);
        assert!(close(species[1].metabolic_rate, 0.314 * 0.5));
        assert_eq!(species[1].max_ingestion_rate, constants.max_ingestion_rate);
        assert_eq!(species[0].growth_rate, 0.5);
        assert_eq!(species[0].carrying_capacity, 42.0);
        assert_eq!(species[0].max_ingestion_rate, 0.0);
        assert_eq!(equations.parameters().species, species.to_vec());
    }

    #[test]
    fn derivative_is_pure() {
        let equations = AtnEquations::new(&producer_consumer_web(), &ModelConstants::default());
        let biomass = [1200.0, 300.0];
        let mut first = [0.0; 2];
        let mut second = [7.0; 2];
        equations.derivative(0.0, &biomass, &mut first);
        equations.derivative(3.5, &biomass, &mut second);
        assert_eq!(first, second);
    }

    #[test]
    fn indicator_vanishes_at_carrying_capacity() {
        let mut web = FoodWeb::new();
        web.add_node(NodeId(1)).unwrap();
        let constants = linear_constants();
        let equations = AtnEquations::new(&web, &constants);
        assert_eq!(equations.steady_state_indicator(0.0, &[10.0]), 0.0);
        assert!(close(equations.steady_state_indicator(0.0, &[5.0]), 0.5));
    }
}
