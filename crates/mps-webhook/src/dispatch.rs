use std::collections::BTreeMap;

use mps_reconcile::EventKind;

/// Event types the platform uses for reachability checks. Answered without
/// signature or persistence.
pub const PING_EVENT_TYPES: [&str; 3] = ["ping", "verification", "type_ping"];

pub fn is_ping(event_type: &str) -> bool {
    PING_EVENT_TYPES.contains(&event_type)
}

/// What to do with one event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub kind: EventKind,
    /// Pull the full posting afterwards; the push only carries a stub.
    pub follow_up: bool,
}

/// Event type → route. Types without a route are stored as `ignored`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTable {
    routes: BTreeMap<String, Route>,
}

impl Default for DispatchTable {
    fn default() -> Self {
        let plain = |kind| Route {
            kind,
            follow_up: false,
        };
        Self::empty()
            .with_route(
                "posting.created",
                Route {
                    kind: EventKind::Created,
                    follow_up: true,
                },
            )
            .with_route("posting.status_changed", plain(EventKind::StatusChanged))
            .with_route("posting.delivered", plain(EventKind::Delivered))
            .with_route("posting.cancelled", plain(EventKind::Cancelled))
            .with_route("posting.shipment_date_changed", plain(EventKind::ShipmentDateChanged))
            .with_route("posting.delivery_date_changed", plain(EventKind::DeliveryDateChanged))
    }
}

impl DispatchTable {
    pub fn empty() -> Self {
        Self {
            routes: BTreeMap::new(),
        }
    }

    pub fn with_route(mut self, event_type: &str, route: Route) -> Self {
        self.routes.insert(event_type.to_string(), route);
        self
    }

    pub fn route(&self, event_type: &str) -> Option<Route> {
        self.routes.get(event_type).copied()
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}
