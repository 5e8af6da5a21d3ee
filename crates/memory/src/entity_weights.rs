//! Entity type weights for query-time score priming.
//!
//! Weights reflect the relative importance of entity types for a personal
//! assistant: people first, then events and organizations.

/// Scales each entity match's contribution to the boost factor.
pub const ENTITY_BOOST_COEFFICIENT: f32 = 0.15;
/// Boost factor cap (1.0 + 0.3 = 1.3x).
pub const MAX_ENTITY_BOOST: f32 = 0.3;
/// Minimum similarity for a fuzzy entity match.
pub const FUZZY_MATCH_THRESHOLD: f32 = 0.85;

/// Weight for an entity type; unknown types default to 0.5.
pub fn get_weight(entity_type: &str) -> f32 {
    match entity_type {
        "PERSON" => 1.0,
        "EVENT" => 0.9,
        "ORG" => 0.8,
        "PRODUCT" => 0.7,
        "WORK_OF_ART" => 0.6,
        "GPE" | "NORP" | "LAW" => 0.5,
        "FAC" => 0.4,
        "LANGUAGE" => 0.3,
        _ => 0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn person_weighs_most() {
        assert_eq!(get_weight("PERSON"), 1.0);
        assert!(get_weight("PERSON") > get_weight("EVENT"));
        assert!(get_weight("EVENT") > get_weight("ORG"));
    }

    #[test]
    fn unknown_types_default() {
        assert_eq!(get_weight("SOMETHING_ELSE"), 0.5);
    }
}
