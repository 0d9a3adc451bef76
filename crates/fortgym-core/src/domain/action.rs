//! The closed action vocabulary.
//!
//! Agents and interactive callers submit raw JSON; the validator turns it
//! into an [`Action`] wrapped in a [`ValidatedAction`]. Backends only ever
//! receive `ValidatedAction`, which has no public constructor.

use serde::Serialize;

/// Action types understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Dig,
    Channel,
    Build,
    Order,
    Wait,
    Inspect,
    Noop,
    Keystroke,
}

impl ActionType {
    pub const ALL: [ActionType; 8] = [
        ActionType::Dig,
        ActionType::Channel,
        ActionType::Build,
        ActionType::Order,
        ActionType::Wait,
        ActionType::Inspect,
        ActionType::Noop,
        ActionType::Keystroke,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Dig => "DIG",
            ActionType::Channel => "CHANNEL",
            ActionType::Build => "BUILD",
            ActionType::Order => "ORDER",
            ActionType::Wait => "WAIT",
            ActionType::Inspect => "INSPECT",
            ActionType::Noop => "NOOP",
            ActionType::Keystroke => "KEYSTROKE",
        }
    }

    /// Case-insensitive lookup.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(name.trim()))
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A map tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Coord {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl Coord {
    pub fn new(x: i64, y: i64, z: i64) -> Self {
        Self { x, y, z }
    }
}

/// A single-level rectangular designation (DIG / CHANNEL).
///
/// Normalized: `origin` is the top-left corner whichever form was submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Designation {
    pub origin: Coord,
    pub width: u32,
    pub height: u32,
}

impl Designation {
    pub fn tiles(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Structures a BUILD action may place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Buildable {
    CarpenterWorkshop,
    MasonWorkshop,
    Still,
    Kitchen,
    Stockpile,
}

impl Buildable {
    pub const ALL: [Buildable; 5] = [
        Buildable::CarpenterWorkshop,
        Buildable::MasonWorkshop,
        Buildable::Still,
        Buildable::Kitchen,
        Buildable::Stockpile,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Buildable::CarpenterWorkshop => "CarpenterWorkshop",
            Buildable::MasonWorkshop => "MasonWorkshop",
            Buildable::Still => "Still",
            Buildable::Kitchen => "Kitchen",
            Buildable::Stockpile => "Stockpile",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.as_str() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BuildParams {
    pub kind: Buildable,
    pub at: Coord,
}

/// Items the manager may be asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderItem {
    Bed,
    Door,
    Table,
    Chair,
    Barrel,
    Bin,
}

impl OrderItem {
    pub const ALL: [OrderItem; 6] = [
        OrderItem::Bed,
        OrderItem::Door,
        OrderItem::Table,
        OrderItem::Chair,
        OrderItem::Barrel,
        OrderItem::Bin,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OrderItem::Bed => "bed",
            OrderItem::Door => "door",
            OrderItem::Table => "table",
            OrderItem::Chair => "chair",
            OrderItem::Barrel => "barrel",
            OrderItem::Bin => "bin",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|i| i.as_str().eq_ignore_ascii_case(name.trim()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrderParams {
    pub item: OrderItem,
    pub quantity: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WaitParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticks: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InspectParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at: Option<Coord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeystrokeParams {
    pub keys: Vec<String>,
}

/// One fortress action. Exactly one per step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "params", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Dig(Designation),
    Channel(Designation),
    Build(BuildParams),
    Order(OrderParams),
    Wait(WaitParams),
    Inspect(InspectParams),
    Noop,
    Keystroke(KeystrokeParams),
}

impl Action {
    pub fn action_type(&self) -> ActionType {
        match self {
            Action::Dig(_) => ActionType::Dig,
            Action::Channel(_) => ActionType::Channel,
            Action::Build(_) => ActionType::Build,
            Action::Order(_) => ActionType::Order,
            Action::Wait(_) => ActionType::Wait,
            Action::Inspect(_) => ActionType::Inspect,
            Action::Noop => ActionType::Noop,
            Action::Keystroke(_) => ActionType::Keystroke,
        }
    }
}

/// An action that passed validation.
///
/// Only `validator::validate` can build one, so anything that accepts a
/// `&ValidatedAction` never sees unchecked input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatedAction {
    #[serde(flatten)]
    action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    intent: Option<String>,
}

impl ValidatedAction {
    pub(crate) fn new(action: Action, intent: Option<String>) -> Self {
        Self { action, intent }
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn action_type(&self) -> ActionType {
        self.action.action_type()
    }

    pub fn intent(&self) -> Option<&str> {
        self.intent.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Interface keys
// ---------------------------------------------------------------------------

/// Named interface keys a KEYSTROKE action may send.
///
/// Character input is additionally allowed as `STRING_A000`..`STRING_A127`.
pub const INTERFACE_KEYS: &[&str] = &[
    // navigation
    "CURSOR_UP",
    "CURSOR_DOWN",
    "CURSOR_LEFT",
    "CURSOR_RIGHT",
    "CURSOR_UPLEFT",
    "CURSOR_UPRIGHT",
    "CURSOR_DOWNLEFT",
    "CURSOR_DOWNRIGHT",
    "CURSOR_UP_FAST",
    "CURSOR_DOWN_FAST",
    "CURSOR_LEFT_FAST",
    "CURSOR_RIGHT_FAST",
    "CURSOR_UP_Z",
    "CURSOR_DOWN_Z",
    // selection
    "SELECT",
    "SEC_SELECT",
    "DESELECT",
    "LEAVESCREEN",
    "LEAVESCREEN_ALL",
    "MENU_CONFIRM",
    // scrolling and tabs
    "STANDARDSCROLL_UP",
    "STANDARDSCROLL_DOWN",
    "STANDARDSCROLL_PAGEUP",
    "STANDARDSCROLL_PAGEDOWN",
    "CHANGETAB",
    "SEC_CHANGETAB",
    "OPTION1",
    "OPTION2",
    "OPTION3",
    "OPTION4",
    "OPTION5",
    // main menus
    "D_DESIGNATE",
    "D_BUILDJOB",
    "D_CIVZONE",
    "D_STOCKPILES",
    "D_ORDERS",
    "D_JOBLIST",
    "D_UNITLIST",
    "D_STATUS",
    "D_LOOK",
    "D_REPORTS",
    // designation submenu
    "DESIGNATE_DIG",
    "DESIGNATE_CHANNEL",
    "DESIGNATE_STAIR_UP",
    "DESIGNATE_STAIR_DOWN",
    "DESIGNATE_STAIR_UPDOWN",
    "DESIGNATE_RAMP",
    "DESIGNATE_CHOP",
    "DESIGNATE_PLANTS",
    "DESIGNATE_SMOOTH",
    "DESIGNATE_UNDO",
    // build submenu
    "BUILDJOB_WORKSHOP",
    "BUILDJOB_FURNACE",
    "BUILDJOB_DOOR",
    "BUILDJOB_BED",
    "BUILDJOB_CHAIR",
    "BUILDJOB_TABLE",
    "BUILDJOB_WALL",
    "BUILDJOB_FLOOR",
    "HOTKEY_MAKE_CARPENTER",
    "HOTKEY_MAKE_MASON",
    "HOTKEY_MAKE_STILL",
    "HOTKEY_MAKE_KITCHEN",
    "HOTKEY_MAKE_CRAFTSMAN",
    // stockpiles and orders
    "STOCKPILE_FOOD",
    "STOCKPILE_FURNITURE",
    "STOCKPILE_STONE",
    "STOCKPILE_WOOD",
    "MANAGER_NEW_ORDER",
    "MANAGER_REMOVE",
    // misc
    "PAUSE",
    "HELP",
];

/// Whether `key` may appear in a KEYSTROKE action.
pub fn is_interface_key(key: &str) -> bool {
    if let Some(code) = key.strip_prefix("STRING_A") {
        return code.len() == 3
            && code.bytes().all(|b| b.is_ascii_digit())
            && code.parse::<u8>().map(|c| c <= 127).unwrap_or(false);
    }
    INTERFACE_KEYS.contains(&key)
}
