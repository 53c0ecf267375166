//! Image filter predicates.
//!
//! Filters travel as JSON arrays, e.g. `["==", "sequenceId", "skey"]`,
//! `["in", "cameraType", "spherical", "fisheye"]` or `["all", <filter>, <filter>]`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{cmp::Ordering, fmt, str::FromStr};

use super::image::Image;
use crate::error::GraphError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKey {
    CameraType,
    CapturedAt,
    ClusterId,
    CreatorId,
    CreatorUsername,
    ExifOrientation,
    Height,
    Id,
    MergeId,
    Merged,
    OwnerId,
    Private,
    QualityScore,
    SequenceId,
    Width,
}

const FILTER_KEYS: [(FilterKey, &str); 15] = [
    (FilterKey::CameraType, "cameraType"),
    (FilterKey::CapturedAt, "capturedAt"),
    (FilterKey::ClusterId, "clusterId"),
    (FilterKey::CreatorId, "creatorId"),
    (FilterKey::CreatorUsername, "creatorUsername"),
    (FilterKey::ExifOrientation, "exifOrientation"),
    (FilterKey::Height, "height"),
    (FilterKey::Id, "id"),
    (FilterKey::MergeId, "mergeId"),
    (FilterKey::Merged, "merged"),
    (FilterKey::OwnerId, "ownerId"),
    (FilterKey::Private, "private"),
    (FilterKey::QualityScore, "qualityScore"),
    (FilterKey::SequenceId, "sequenceId"),
    (FilterKey::Width, "width"),
];

impl FilterKey {
    pub fn as_str(&self) -> &'static str {
        FILTER_KEYS
            .iter()
            .find(|(key, _)| key == self)
            .map(|(_, name)| *name)
            .unwrap_or_default()
    }
}

impl FromStr for FilterKey {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FILTER_KEYS
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(key, _)| *key)
            .ok_or_else(|| GraphError::InvalidOperation(format!("unknown filter key {s:?}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl FilterValue {
    fn compare(&self, other: &FilterValue) -> Option<Ordering> {
        match (self, other) {
            (FilterValue::Number(a), FilterValue::Number(b)) => a.partial_cmp(b),
            (FilterValue::String(a), FilterValue::String(b)) => Some(a.cmp(b)),
            (FilterValue::Bool(a), FilterValue::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl TryFrom<&Value> for FilterValue {
    type Error = GraphError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(FilterValue::Null),
            Value::Bool(b) => Ok(FilterValue::Bool(*b)),
            Value::Number(n) => n.as_f64().map(FilterValue::Number).ok_or_else(|| {
                GraphError::InvalidOperation(format!("filter number out of range: {n}"))
            }),
            Value::String(s) => Ok(FilterValue::String(s.clone())),
            other => Err(GraphError::InvalidOperation(format!(
                "filter values must be scalars, got {other}"
            ))),
        }
    }
}

impl From<&FilterValue> for Value {
    fn from(value: &FilterValue) -> Self {
        match value {
            FilterValue::Null => Value::Null,
            FilterValue::Bool(b) => Value::Bool(*b),
            FilterValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FilterValue::String(s) => Value::String(s.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOperator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ComparisonOperator {
    fn as_str(&self) -> &'static str {
        match self {
            ComparisonOperator::Eq => "==",
            ComparisonOperator::Ne => "!=",
            ComparisonOperator::Lt => "<",
            ComparisonOperator::Le => "<=",
            ComparisonOperator::Gt => ">",
            ComparisonOperator::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOperator {
    In,
    NotIn,
}

/// Predicate over image attributes. The default, an empty conjunction, passes every image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum FilterExpression {
    All(Vec<FilterExpression>),
    Comparison {
        operator: ComparisonOperator,
        key: FilterKey,
        value: FilterValue,
    },
    Set {
        operator: SetOperator,
        key: FilterKey,
        values: Vec<FilterValue>,
    },
}

impl Default for FilterExpression {
    fn default() -> Self {
        FilterExpression::All(Vec::new())
    }
}

impl FilterExpression {
    pub fn eq(key: FilterKey, value: FilterValue) -> Self {
        FilterExpression::Comparison {
            operator: ComparisonOperator::Eq,
            key,
            value,
        }
    }

    pub fn passes_all(&self) -> bool {
        match self {
            FilterExpression::All(filters) => filters.iter().all(FilterExpression::passes_all),
            _ => false,
        }
    }

    pub fn matches(&self, image: &Image) -> bool {
        match self {
            FilterExpression::All(filters) => filters.iter().all(|f| f.matches(image)),
            FilterExpression::Comparison {
                operator,
                key,
                value,
            } => {
                let actual = image.filter_value(*key);
                match operator {
                    ComparisonOperator::Eq => actual == *value,
                    ComparisonOperator::Ne => actual != *value,
                    ComparisonOperator::Lt => actual.compare(value) == Some(Ordering::Less),
                    ComparisonOperator::Le => matches!(
                        actual.compare(value),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                    ComparisonOperator::Gt => {
                        actual.compare(value) == Some(Ordering::Greater)
                    }
                    ComparisonOperator::Ge => matches!(
                        actual.compare(value),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                }
            }
            FilterExpression::Set {
                operator,
                key,
                values,
            } => {
                let actual = image.filter_value(*key);
                let member = values.contains(&actual);
                match operator {
                    SetOperator::In => member,
                    SetOperator::NotIn => !member,
                }
            }
        }
    }
}

fn invalid(value: &Value, reason: &str) -> GraphError {
    GraphError::InvalidOperation(format!("invalid filter {value}: {reason}"))
}

impl TryFrom<Value> for FilterExpression {
    type Error = GraphError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Some(items) = value.as_array() else {
            return Err(invalid(&value, "expected an array"));
        };
        let Some(operator) = items.first().and_then(Value::as_str) else {
            return Err(invalid(&value, "missing operator"));
        };
        if operator == "all" {
            return items[1..]
                .iter()
                .map(|item| FilterExpression::try_from(item.clone()))
                .collect::<Result<Vec<_>, _>>()
                .map(FilterExpression::All);
        }
        let Some(key) = items.get(1).and_then(Value::as_str) else {
            return Err(invalid(&value, "missing key"));
        };
        let key = key.parse::<FilterKey>()?;
        let set_operator = match operator {
            "in" => Some(SetOperator::In),
            "!in" => Some(SetOperator::NotIn),
            _ => None,
        };
        if let Some(operator) = set_operator {
            let values = items[2..]
                .iter()
                .map(FilterValue::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(FilterExpression::Set {
                operator,
                key,
                values,
            });
        }
        let operator = match operator {
            "==" => ComparisonOperator::Eq,
            "!=" => ComparisonOperator::Ne,
            "<" => ComparisonOperator::Lt,
            "<=" => ComparisonOperator::Le,
            ">" => ComparisonOperator::Gt,
            ">=" => ComparisonOperator::Ge,
            _ => return Err(invalid(&value, "unknown operator")),
        };
        if items.len() != 3 {
            return Err(invalid(&value, "comparisons take exactly one value"));
        }
        Ok(FilterExpression::Comparison {
            operator,
            key,
            value: FilterValue::try_from(&items[2])?,
        })
    }
}

impl From<FilterExpression> for Value {
    fn from(filter: FilterExpression) -> Self {
        match filter {
            FilterExpression::All(filters) => {
                let mut items = vec![Value::from("all")];
                items.extend(filters.into_iter().map(Value::from));
                Value::Array(items)
            }
            FilterExpression::Comparison {
                operator,
                key,
                value,
            } => Value::Array(vec![
                Value::from(operator.as_str()),
                Value::from(key.as_str()),
                Value::from(&value),
            ]),
            FilterExpression::Set {
                operator,
                key,
                values,
            } => {
                let operator = match operator {
                    SetOperator::In => "in",
                    SetOperator::NotIn => "!in",
                };
                let mut items = vec![Value::from(operator), Value::from(key.as_str())];
                items.extend(values.iter().map(Value::from));
                Value::Array(items)
            }
        }
    }
}

impl fmt::Display for FilterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::from(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CoreImageEnt, IdEnt, LngLat, SpatialImageEnt};
    use serde_json::json;

    fn image(id: &str, sequence: &str, camera_type: &str, quality: Option<f64>) -> Image {
        Image::new_complete(
            CoreImageEnt {
                id: id.to_string(),
                geometry: LngLat::new(0.0, 0.0),
                computed_geometry: None,
                sequence: IdEnt {
                    id: sequence.to_string(),
                },
            },
            SpatialImageEnt {
                id: id.to_string(),
                camera_type: camera_type.to_string(),
                quality_score: quality,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_default_passes_everything() {
        let filter = FilterExpression::default();
        assert!(filter.passes_all());
        assert!(filter.matches(&image("a", "s", "perspective", None)));
    }

    #[test]
    fn test_parse_and_match_comparison() {
        let filter = FilterExpression::try_from(json!(["==", "sequenceId", "s1"])).unwrap();
        assert_eq!(
            filter,
            FilterExpression::eq(FilterKey::SequenceId, FilterValue::String("s1".into()))
        );
        assert!(filter.matches(&image("a", "s1", "perspective", None)));
        assert!(!filter.matches(&image("b", "s2", "perspective", None)));
    }

    #[test]
    fn test_ordering_against_missing_value_fails() {
        let filter = FilterExpression::try_from(json!([">=", "qualityScore", 0.5])).unwrap();
        assert!(filter.matches(&image("a", "s", "perspective", Some(0.7))));
        assert!(!filter.matches(&image("b", "s", "perspective", Some(0.2))));
        assert!(!filter.matches(&image("c", "s", "perspective", None)));
    }

    #[test]
    fn test_set_and_conjunction() {
        let filter: FilterExpression = serde_json::from_value(json!([
            "all",
            ["in", "cameraType", "spherical", "fisheye"],
            ["!=", "id", "skip"]
        ]))
        .unwrap();
        assert!(!filter.passes_all());
        assert!(filter.matches(&image("a", "s", "spherical", None)));
        assert!(!filter.matches(&image("skip", "s", "spherical", None)));
        assert!(!filter.matches(&image("b", "s", "perspective", None)));

        let back = serde_json::to_value(&filter).unwrap();
        assert_eq!(back[1], json!(["in", "cameraType", "spherical", "fisheye"]));
    }

    #[test]
    fn test_rejects_malformed_filters() {
        for value in [
            json!("=="),
            json!(["~=", "id", "a"]),
            json!(["==", "nope", "a"]),
            json!(["==", "id"]),
            json!(["in", "id", ["nested"]]),
        ] {
            assert!(
                matches!(
                    FilterExpression::try_from(value.clone()),
                    Err(GraphError::InvalidOperation(_))
                ),
                "{value} should not parse"
            );
        }
    }
}
