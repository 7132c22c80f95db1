//! Which link reaches which MAVLink endpoint.

/// One accepted connection or opened serial device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub sys: u8,
    pub comp: u8,
    pub link: LinkId,
}

/// Endpoints learned from heartbeats, in the order they first appeared.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `(sys, comp)` behind `link`. False when the endpoint is already known.
    pub fn learn(&mut self, link: LinkId, sys: u8, comp: u8) -> bool {
        if self.routes.iter().any(|r| r.sys == sys && r.comp == comp) {
            return false;
        }
        self.routes.push(Route { sys, comp, link });
        true
    }

    /// Forgets every endpoint behind `link` and returns them.
    pub fn drop_link(&mut self, link: LinkId) -> Vec<Route> {
        let (gone, kept): (Vec<Route>, Vec<Route>) = self.routes.drain(..).partition(|r| r.link == link);
        self.routes = kept;
        gone
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Links a frame from `origin` addressed to `(sys, comp)` goes out on.
    /// System 0 is a broadcast; component 0 matches any component.
    /// Each link appears once and the origin never does.
    pub fn destinations(&self, origin: LinkId, (sys, comp): (u8, u8)) -> Vec<LinkId> {
        let mut out: Vec<LinkId> = Vec::new();
        for r in &self.routes {
            if r.link == origin || out.contains(&r.link) {
                continue;
            }
            let hit = sys == 0 || (r.sys == sys && (comp == 0 || r.comp == comp));
            if hit {
                out.push(r.link);
            }
        }
        out
    }
}
