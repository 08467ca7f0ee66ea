//! Host-based request routing
//!
//! Routes are an ordered list of host prefixes fixed at construction; the
//! first matching prefix wins and everything else goes to the default.

/// Maximum DNS hostname length
const MAX_HOSTNAME_LEN: usize = 253;

/// Prefix that selects the admin handler
pub const ADMIN_PREFIX: &str = "admin.";

#[derive(Debug, Clone)]
struct Route<T> {
    prefix: String,
    target: T,
}

/// Selects a target by the prefix of the request's Host header
#[derive(Debug, Clone)]
pub struct SubdomainRouter<T> {
    routes: Vec<Route<T>>,
    default: T,
}

impl<T> SubdomainRouter<T> {
    pub fn new(default: T) -> Self {
        Self {
            routes: Vec::new(),
            default,
        }
    }

    /// Add a route; routes are evaluated in the order they were added
    pub fn with_route(mut self, prefix: &str, target: T) -> Self {
        self.routes.push(Route {
            prefix: prefix.to_ascii_lowercase(),
            target,
        });
        self
    }

    /// Pick the target for a Host header value
    pub fn route(&self, host: Option<&str>) -> &T {
        let Some(hostname) = host.and_then(normalize_host) else {
            return &self.default;
        };

        self.routes
            .iter()
            .find(|route| hostname.starts_with(&route.prefix))
            .map(|route| &route.target)
            .unwrap_or(&self.default)
    }

    pub fn default_target(&self) -> &T {
        &self.default
    }
}

/// Lowercased hostname without port, or None if it is not a valid hostname
fn normalize_host(host: &str) -> Option<String> {
    let hostname = host.split(':').next()?.trim();

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Target {
        Admin,
        Www,
        Couch,
    }

    fn router() -> SubdomainRouter<Target> {
        SubdomainRouter::new(Target::Www).with_route(ADMIN_PREFIX, Target::Admin)
    }

    #[test]
    fn test_admin_subdomain() {
        let router = router();
        assert_eq!(*router.route(Some("admin.example.com")), Target::Admin);
        assert_eq!(*router.route(Some("admin.example.com:8080")), Target::Admin);
        assert_eq!(*router.route(Some("ADMIN.Example.com")), Target::Admin);
    }

    #[test]
    fn test_default_routes() {
        let router = router();
        assert_eq!(*router.route(Some("example.com")), Target::Www);
        assert_eq!(*router.route(Some("www.example.com")), Target::Www);
        // Prefix match only
        assert_eq!(*router.route(Some("notadmin.example.com")), Target::Www);
        assert_eq!(*router.route(Some("admin")), Target::Www);
    }

    #[test]
    fn test_missing_or_invalid_host_uses_default() {
        let router = router();
        assert_eq!(*router.route(None), Target::Www);
        assert_eq!(*router.route(Some("")), Target::Www);
        assert_eq!(*router.route(Some("admin.exa mple.com")), Target::Www);
        assert_eq!(*router.route(Some(&"a".repeat(300))), Target::Www);
    }

    #[test]
    fn test_first_match_wins() {
        let router = SubdomainRouter::new(Target::Www)
            .with_route("couch.", Target::Couch)
            .with_route("couch.admin.", Target::Admin)
            .with_route(ADMIN_PREFIX, Target::Admin);

        assert_eq!(*router.route(Some("couch.admin.example.com")), Target::Couch);
        assert_eq!(*router.route(Some("admin.example.com")), Target::Admin);
        assert_eq!(*router.default_target(), Target::Www);
    }
}
