//! Shape enforcement for step collections.
//!
//! `WorkflowDefinition.steps` is positional and `PresetOverrides.steps` is keyed by
//! name. Serde would report either mismatch with a generic "invalid type" message;
//! these visitors reject the wrong shape with an explicit reason instead.

use std::fmt;

use indexmap::IndexMap;
use serde::Deserializer;
use serde::de::{self, MapAccess, SeqAccess, Visitor};

use super::{StepDefinition, StepOverride};

pub const STEPS_SHAPE_MESSAGE: &str = "workflow steps must be an ordered sequence of step definitions, found a mapping";
pub const OVERRIDE_STEPS_SHAPE_MESSAGE: &str = "overrides.steps must be a mapping keyed by step name, found a sequence";

/// Deserializes `steps` as a sequence, rejecting a mapping.
pub fn deserialize_step_sequence<'de, D>(deserializer: D) -> Result<Vec<StepDefinition>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(StepSequenceVisitor)
}

/// Deserializes `overrides.steps` as a name-keyed mapping, rejecting a sequence.
pub fn deserialize_step_overrides<'de, D>(deserializer: D) -> Result<IndexMap<String, StepOverride>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(StepOverrideMapVisitor)
}

struct StepSequenceVisitor;

impl<'de> Visitor<'de> for StepSequenceVisitor {
    type Value = Vec<StepDefinition>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a sequence of step definitions")
    }

    fn visit_seq<A>(self, mut sequence: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut steps = Vec::with_capacity(sequence.size_hint().unwrap_or(0));
        while let Some(step) = sequence.next_element::<StepDefinition>()? {
            steps.push(step);
        }
        Ok(steps)
    }

    fn visit_map<A>(self, _map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        Err(de::Error::custom(STEPS_SHAPE_MESSAGE))
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(Vec::new())
    }

    fn visit_none<E>(self) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(Vec::new())
    }
}

struct StepOverrideMapVisitor;

impl<'de> Visitor<'de> for StepOverrideMapVisitor {
    type Value = IndexMap<String, StepOverride>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a mapping of step name to override fragment")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut overrides = IndexMap::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((step_name, fragment)) = map.next_entry::<String, StepOverride>()? {
            if overrides.contains_key(&step_name) {
                return Err(de::Error::custom(format!("duplicate override for step '{step_name}'")));
            }
            overrides.insert(step_name, fragment);
        }
        Ok(overrides)
    }

    fn visit_seq<A>(self, _sequence: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        Err(de::Error::custom(OVERRIDE_STEPS_SHAPE_MESSAGE))
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(IndexMap::new())
    }

    fn visit_none<E>(self) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(IndexMap::new())
    }
}
