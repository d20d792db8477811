//! Map rendering.
//!
//! [`MapRenderer`] turns a roster into a [`MapView`]: a center, a zoom level
//! and one [`Marker`] per member with valid coordinates. Members without
//! coordinates are skipped. A [`MapSurface`] presents the view; the
//! [`html`] surface writes a Leaflet page.

pub mod html;

use serde::Serialize;
use uuid::Uuid;

use crate::config::{MapConfig, RecenterPolicy};
use crate::device::Position;
use crate::error::Result;
use crate::roster::Member;

pub use html::{HtmlFileSurface, PageOptions};

/// Center used when no member has coordinates.
pub const FALLBACK_CENTER: Position = Position {
    lat: 37.5665,
    lng: 126.9780,
};

/// Zoom level of a fresh map.
pub const DEFAULT_ZOOM: u8 = 13;

/// Popup title for members without a name.
pub const UNNAMED: &str = "User";

/// A map pin for one member.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Marker {
    /// Member the pin belongs to.
    pub member_id: Uuid,
    /// Where the pin goes.
    pub position: Position,
    /// Popup heading.
    pub title: String,
    /// Popup detail line.
    pub subtitle: String,
}

impl Marker {
    /// The marker for `member`, or `None` if it has no valid coordinates.
    #[must_use]
    pub fn for_member(member: &Member) -> Option<Self> {
        let position = member.position()?;
        let title = member
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(UNNAMED)
            .to_string();
        Some(Self {
            member_id: member.id,
            position,
            title,
            subtitle: format!("Last: {}", member.last_seen()),
        })
    }
}

/// Everything needed to draw the map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapView {
    /// Map center.
    pub center: Position,
    /// Zoom level.
    pub zoom: u8,
    /// Member pins, in roster order.
    pub markers: Vec<Marker>,
}

impl MapView {
    /// A view of `members`, centered on the first member with valid
    /// coordinates or on `fallback`.
    #[must_use]
    pub fn from_members(members: &[Member], fallback: Position, zoom: u8) -> Self {
        Self {
            center: first_valid_position(members).unwrap_or(fallback),
            zoom,
            markers: members.iter().filter_map(Marker::for_member).collect(),
        }
    }
}

/// Position of the first member with valid coordinates.
#[must_use]
pub fn first_valid_position(members: &[Member]) -> Option<Position> {
    members.iter().find_map(Member::position)
}

/// A rendered view and whether the map should move.
#[derive(Debug, Clone, PartialEq)]
pub struct MapUpdate {
    /// The view to show.
    pub view: MapView,
    /// Where to pan, when the center moved since the last view.
    pub pan_to: Option<Position>,
}

/// Renders rosters into map views, tracking the center between renders.
#[derive(Debug, Clone)]
pub struct MapRenderer {
    fallback: Position,
    zoom: u8,
    policy: RecenterPolicy,
    current: Option<MapView>,
}

impl Default for MapRenderer {
    fn default() -> Self {
        Self::new(FALLBACK_CENTER, DEFAULT_ZOOM, RecenterPolicy::default())
    }
}

impl MapRenderer {
    /// Create a renderer.
    #[must_use]
    pub fn new(fallback: Position, zoom: u8, policy: RecenterPolicy) -> Self {
        Self {
            fallback,
            zoom,
            policy,
            current: None,
        }
    }

    /// Create a renderer from the map configuration.
    #[must_use]
    pub fn from_config(config: &MapConfig) -> Self {
        let fallback =
            Position::new(config.fallback_lat, config.fallback_lng).unwrap_or(FALLBACK_CENTER);
        Self::new(fallback, config.zoom, config.recenter)
    }

    /// Render `members`.
    ///
    /// The first render centers on the first valid member. Later renders
    /// pan to it when it moved, unless the policy keeps the center.
    pub fn render(&mut self, members: &[Member]) -> MapUpdate {
        let mut view = MapView::from_members(members, self.fallback, self.zoom);
        let pan_to = match (&self.current, self.policy) {
            (None, _) => None,
            (Some(previous), RecenterPolicy::Keep) => {
                view.center = previous.center;
                None
            }
            (Some(previous), RecenterPolicy::PanToFirst) => {
                (previous.center != view.center).then_some(view.center)
            }
        };
        self.current = Some(view.clone());
        MapUpdate { view, pan_to }
    }

    /// A view with no markers at the fallback center.
    #[must_use]
    pub fn placeholder(&self) -> MapView {
        MapView::from_members(&[], self.fallback, self.zoom)
    }

    /// The last rendered view.
    #[must_use]
    pub fn current(&self) -> Option<&MapView> {
        self.current.as_ref()
    }

    /// Forget the last view, so the next render starts fresh.
    pub fn reset(&mut self) {
        self.current = None;
    }
}

/// Somewhere a map view can be shown.
pub trait MapSurface: Send {
    /// The name of this surface (for logging).
    fn name(&self) -> &'static str;

    /// Show `update`.
    ///
    /// # Errors
    ///
    /// Returns an error if the view cannot be presented.
    fn present(&mut self, update: &MapUpdate) -> Result<()>;
}
