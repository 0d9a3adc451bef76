//! Action validation.
//!
//! [`validate`] is pure: it reads the proposed JSON and the current
//! observation state and either returns a [`ValidatedAction`] or says why the
//! action was refused. Checks run in a fixed order: shape, type, parameters.

use serde_json::{Map, Value};

use fortgym_trace::ErrorKind;

use crate::domain::action::{
    is_interface_key, Action, ActionType, BuildParams, Buildable, Coord, Designation,
    InspectParams, KeystrokeParams, OrderItem, OrderParams, ValidatedAction, WaitParams,
};

/// Largest designation edge, in tiles.
pub const MAX_DESIGNATION_EDGE: i64 = 30;
/// ORDER quantity range, inclusive.
pub const ORDER_QUANTITY_RANGE: (i64, i64) = (1, 5);
/// WAIT tick range, inclusive.
pub const WAIT_TICKS_RANGE: (i64, i64) = (1, 1000);
/// Most keys a single KEYSTROKE action may send.
pub const MAX_KEYSTROKES: usize = 20;

const TOP_LEVEL_KEYS: [&str; 3] = ["type", "params", "intent"];

/// Why an action was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    InvalidShape,
    InvalidType,
    InvalidParams,
    OutOfBounds,
}

impl ValidationErrorKind {
    pub fn as_str(self) -> &'static str {
        ErrorKind::from(self).as_str()
    }
}

impl From<ValidationErrorKind> for ErrorKind {
    fn from(kind: ValidationErrorKind) -> Self {
        match kind {
            ValidationErrorKind::InvalidShape => ErrorKind::InvalidShape,
            ValidationErrorKind::InvalidType => ErrorKind::InvalidType,
            ValidationErrorKind::InvalidParams => ErrorKind::InvalidParams,
            ValidationErrorKind::OutOfBounds => ErrorKind::OutOfBounds,
        }
    }
}

impl std::fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {reason}")]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub reason: String,
}

impl ValidationError {
    fn new(kind: ValidationErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    fn shape(reason: impl Into<String>) -> Self {
        Self::new(ValidationErrorKind::InvalidShape, reason)
    }

    fn params(reason: impl Into<String>) -> Self {
        Self::new(ValidationErrorKind::InvalidParams, reason)
    }

    fn bounds(reason: impl Into<String>) -> Self {
        Self::new(ValidationErrorKind::OutOfBounds, reason)
    }
}

type Checked<T> = std::result::Result<T, ValidationError>;

/// Validate one proposed action against the current observation state.
pub fn validate(raw: &Value, state: &Value) -> Checked<ValidatedAction> {
    // shape
    let obj = match raw {
        Value::Object(obj) => obj,
        Value::Array(_) => {
            return Err(ValidationError::shape(
                "expected a single action object, got a list",
            ))
        }
        _ => return Err(ValidationError::shape("expected a single action object")),
    };
    for nested in ["actions", "plan"] {
        if obj.contains_key(nested) {
            return Err(ValidationError::shape(format!(
                "one action per step; `{nested}` is not allowed"
            )));
        }
    }
    if let Some(extra) = obj.keys().find(|k| !TOP_LEVEL_KEYS.contains(&k.as_str())) {
        return Err(ValidationError::shape(format!("unexpected key `{extra}`")));
    }
    let type_value = obj
        .get("type")
        .ok_or_else(|| ValidationError::shape("missing `type`"))?;
    let params = match obj.get("params") {
        None => None,
        Some(Value::Object(p)) => Some(p),
        Some(_) => return Err(ValidationError::shape("`params` must be an object")),
    };
    let intent = match obj.get("intent") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(ValidationError::shape("`intent` must be a string")),
    };

    // type
    let type_name = type_value.as_str().ok_or_else(|| {
        ValidationError::new(ValidationErrorKind::InvalidType, "`type` must be a string")
    })?;
    let action_type = ActionType::parse(type_name).ok_or_else(|| {
        ValidationError::new(
            ValidationErrorKind::InvalidType,
            format!("unsupported action type `{type_name}`"),
        )
    })?;

    let empty = Map::new();
    let params = match (params, action_type) {
        (Some(p), _) => p,
        (None, ActionType::Noop) => &empty,
        (None, _) => return Err(ValidationError::shape("missing `params`")),
    };

    // parameters
    let bounds = MapBounds::from_state(state);
    let action = match action_type {
        ActionType::Dig => Action::Dig(designation(params, &bounds)?),
        ActionType::Channel => Action::Channel(designation(params, &bounds)?),
        ActionType::Build => Action::Build(build(params, &bounds)?),
        ActionType::Order => Action::Order(order(params)?),
        ActionType::Wait => Action::Wait(wait(params)?),
        ActionType::Inspect => Action::Inspect(inspect(params, &bounds)?),
        ActionType::Noop => Action::Noop,
        ActionType::Keystroke => Action::Keystroke(keystroke(params)?),
    };

    Ok(ValidatedAction::new(action, intent))
}

// ---------------------------------------------------------------------------
// Map bounds
// ---------------------------------------------------------------------------

/// Exclusive upper bounds taken from the observation's `map_bounds`.
#[derive(Debug, Clone, Copy, Default)]
struct MapBounds(Option<[i64; 3]>);

impl MapBounds {
    fn from_state(state: &Value) -> Self {
        let dims = state
            .get("map_bounds")
            .and_then(Value::as_array)
            .filter(|a| a.len() == 3)
            .and_then(|a| {
                let v: Vec<i64> = a.iter().filter_map(Value::as_i64).collect();
                <[i64; 3]>::try_from(v).ok()
            });
        MapBounds(dims)
    }

    fn check(&self, c: Coord, what: &str) -> Checked<()> {
        if c.x < 0 || c.y < 0 || c.z < 0 {
            return Err(ValidationError::bounds(format!(
                "{what} ({}, {}, {}) has a negative coordinate",
                c.x, c.y, c.z
            )));
        }
        if let Some([bx, by, bz]) = self.0 {
            if c.x >= bx || c.y >= by || c.z >= bz {
                return Err(ValidationError::bounds(format!(
                    "{what} ({}, {}, {}) is outside map bounds ({bx}, {by}, {bz})",
                    c.x, c.y, c.z
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn int(params: &Map<String, Value>, key: &str) -> Checked<Option<i64>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| ValidationError::params(format!("`{key}` must be an integer"))),
    }
}

fn triple(params: &Map<String, Value>, key: &str) -> Checked<Option<[i64; 3]>> {
    let Some(value) = params.get(key) else {
        return Ok(None);
    };
    let bad = || ValidationError::params(format!("`{key}` must be three integers"));
    let items = value.as_array().filter(|a| a.len() == 3).ok_or_else(bad)?;
    let mut out = [0i64; 3];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = item.as_i64().ok_or_else(bad)?;
    }
    Ok(Some(out))
}

fn coord_xyz(params: &Map<String, Value>) -> Checked<Option<Coord>> {
    let x = int(params, "x")?;
    let y = int(params, "y")?;
    let z = int(params, "z")?.unwrap_or(0);
    match (x, y) {
        (Some(x), Some(y)) => Ok(Some(Coord::new(x, y, z))),
        (None, None) => Ok(None),
        _ => Err(ValidationError::params("both `x` and `y` are required")),
    }
}

// ---------------------------------------------------------------------------
// Per-type checks
// ---------------------------------------------------------------------------

/// Inclusive tile count between two coordinates, saturating at `i64::MAX`.
fn span(a: i64, b: i64) -> i64 {
    i64::try_from(a.abs_diff(b)).map_or(i64::MAX, |d| d.saturating_add(1))
}

fn designation(params: &Map<String, Value>, bounds: &MapBounds) -> Checked<Designation> {
    let (origin, width, height) = match (
        triple(params, "area")?,
        triple(params, "size")?,
        triple(params, "from")?,
        triple(params, "to")?,
    ) {
        (Some([x, y, z]), Some([w, h, d]), _, _) => {
            if w < 0 || h < 0 || d < 0 {
                return Err(ValidationError::params("`size` must not be negative"));
            }
            if w == 0 || h == 0 {
                return Err(ValidationError::params("`size` must cover at least one tile"));
            }
            if d != 1 {
                return Err(ValidationError::bounds(format!(
                    "designation must stay on one z-level (depth {d})"
                )));
            }
            (Coord::new(x, y, z), w, h)
        }
        (_, _, Some(from), Some(to)) => {
            if from[2] != to[2] {
                return Err(ValidationError::bounds(format!(
                    "designation spans z-levels {} and {}",
                    from[2], to[2]
                )));
            }
            let origin = Coord::new(from[0].min(to[0]), from[1].min(to[1]), from[2]);
            (origin, span(from[0], to[0]), span(from[1], to[1]))
        }
        _ => {
            return Err(ValidationError::params(
                "designation needs `area` + `size` or `from` + `to`",
            ))
        }
    };

    if width > MAX_DESIGNATION_EDGE || height > MAX_DESIGNATION_EDGE {
        return Err(ValidationError::bounds(format!(
            "designation {width}x{height} exceeds {MAX_DESIGNATION_EDGE}x{MAX_DESIGNATION_EDGE}"
        )));
    }
    bounds.check(origin, "designation origin")?;
    let corner = match (
        origin.x.checked_add(width - 1),
        origin.y.checked_add(height - 1),
    ) {
        (Some(x), Some(y)) => Coord::new(x, y, origin.z),
        _ => {
            return Err(ValidationError::bounds(
                "designation corner lies beyond any map",
            ))
        }
    };
    bounds.check(corner, "designation corner")?;

    Ok(Designation {
        origin,
        width: width as u32,
        height: height as u32,
    })
}

fn build(params: &Map<String, Value>, bounds: &MapBounds) -> Checked<BuildParams> {
    let kind_name = params
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::params("BUILD requires a `kind`"))?;
    let kind = Buildable::parse(kind_name)
        .ok_or_else(|| ValidationError::params(format!("cannot build `{kind_name}`")))?;
    let at = coord_xyz(params)?
        .ok_or_else(|| ValidationError::params("BUILD requires `x` and `y`"))?;
    bounds.check(at, "build site")?;
    Ok(BuildParams { kind, at })
}

fn order(params: &Map<String, Value>) -> Checked<OrderParams> {
    let item_name = params
        .get("item")
        .or_else(|| params.get("job"))
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::params("ORDER requires an `item`"))?;
    let item = OrderItem::parse(item_name).ok_or_else(|| {
        ValidationError::params(format!("`{item_name}` is not an orderable item"))
    })?;

    let raw_qty = params.get("quantity").or_else(|| params.get("qty"));
    let quantity = raw_qty
        .and_then(Value::as_i64)
        .ok_or_else(|| ValidationError::params("ORDER requires an integer `quantity`"))?;
    let (lo, hi) = ORDER_QUANTITY_RANGE;
    if !(lo..=hi).contains(&quantity) {
        return Err(ValidationError::params(format!(
            "quantity {quantity} outside [{lo}, {hi}]"
        )));
    }

    Ok(OrderParams {
        item,
        quantity: quantity as u8,
    })
}

fn wait(params: &Map<String, Value>) -> Checked<WaitParams> {
    let ticks = int(params, "ticks")?;
    if let Some(t) = ticks {
        let (lo, hi) = WAIT_TICKS_RANGE;
        if !(lo..=hi).contains(&t) {
            return Err(ValidationError::params(format!(
                "ticks {t} outside [{lo}, {hi}]"
            )));
        }
    }
    Ok(WaitParams {
        ticks: ticks.map(|t| t as u32),
    })
}

fn inspect(params: &Map<String, Value>, bounds: &MapBounds) -> Checked<InspectParams> {
    let at = coord_xyz(params)?;
    if let Some(c) = at {
        bounds.check(c, "inspect target")?;
    }
    Ok(InspectParams { at })
}

fn keystroke(params: &Map<String, Value>) -> Checked<KeystrokeParams> {
    let keys = params
        .get("keys")
        .and_then(Value::as_array)
        .ok_or_else(|| ValidationError::params("KEYSTROKE requires a `keys` list"))?;
    if keys.is_empty() || keys.len() > MAX_KEYSTROKES {
        return Err(ValidationError::params(format!(
            "KEYSTROKE takes 1 to {MAX_KEYSTROKES} keys, got {}",
            keys.len()
        )));
    }
    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        let name = key
            .as_str()
            .ok_or_else(|| ValidationError::params("keys must be strings"))?;
        if !is_interface_key(name) {
            return Err(ValidationError::params(format!("key `{name}` is not allowed")));
        }
        out.push(name.to_string());
    }
    Ok(KeystrokeParams { keys: out })
}
