// Static route table, evaluated top to bottom; the first entry whose path predicate matches wins.

use axum::http::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAction {
    /// Answer 404 without touching the cache or any mirror.
    NotFound,
    /// Serve from the cache, fetching from mirrors on a miss.
    Artifact,
}

pub struct Route {
    pub name: &'static str,
    pub methods: &'static [Method],
    pub matches: fn(&str) -> bool,
    pub action: RouteAction,
}

const READ_METHODS: &[Method] = &[Method::GET, Method::HEAD];

pub static ROUTES: &[Route] = &[
    Route {
        name: "favicon",
        methods: READ_METHODS,
        matches: is_favicon,
        action: RouteAction::NotFound,
    },
    Route {
        name: "index",
        methods: READ_METHODS,
        matches: is_index,
        action: RouteAction::NotFound,
    },
    Route {
        name: "artifact",
        methods: READ_METHODS,
        matches: any_path,
        action: RouteAction::Artifact,
    },
];

pub enum Dispatch {
    Matched(&'static Route),
    MethodNotAllowed,
    Unrouted,
}

/// `path` is the request path with or without its leading slash.
pub fn dispatch(method: &Method, path: &str) -> Dispatch {
    let path = path.trim_start_matches('/');
    match ROUTES.iter().find(|route| (route.matches)(path)) {
        Some(route) if route.methods.contains(method) => Dispatch::Matched(route),
        Some(_) => Dispatch::MethodNotAllowed,
        None => Dispatch::Unrouted,
    }
}

/// Whether `path` resolves to a noise route. Run again on the normalized path
/// so `./favicon.ico` and `x/../index.html` stay unreachable.
pub fn is_reserved(path: &str) -> bool {
    let path = path.trim_start_matches('/');
    ROUTES
        .iter()
        .find(|route| (route.matches)(path))
        .is_some_and(|route| route.action == RouteAction::NotFound)
}

fn is_favicon(path: &str) -> bool {
    path == "favicon.ico"
}

/// Repository index requests, including the Nexus `.index/` directory.
fn is_index(path: &str) -> bool {
    path.starts_with("index") || path.starts_with(".index")
}

fn any_path(_: &str) -> bool {
    true
}
