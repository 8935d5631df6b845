use crate::body::Request;
use globset::Glob;
use globset::GlobMatcher;
use http::Method;
use http::header::HOST;
use http::uri::Authority;

/// Match predicate for conditional middleware. All filters attached to a
/// group must match for the group's handler to run.
pub trait Filter: Send + Sync {
    fn matches(&self, req: &Request) -> bool;
}

pub struct FilterFn<F>(pub F);

impl<F> Filter for FilterFn<F>
where
    F: Fn(&Request) -> bool + Send + Sync,
{
    fn matches(&self, req: &Request) -> bool {
        (self.0)(req)
    }
}

/// Glob match on the request host (port stripped), e.g. `*.example.com`.
pub struct HostFilter {
    matcher: GlobMatcher,
}

impl HostFilter {
    pub fn new(pattern: &str) -> Result<Self, globset::Error> {
        Ok(HostFilter {
            matcher: Glob::new(pattern)?.compile_matcher(),
        })
    }
}

impl Filter for HostFilter {
    fn matches(&self, req: &Request) -> bool {
        match request_host(req) {
            Some(host) => self.matcher.is_match(host),
            None => false,
        }
    }
}

/// Glob match on the request path, e.g. `/api/**`.
pub struct PathFilter {
    matcher: GlobMatcher,
}

impl PathFilter {
    pub fn new(pattern: &str) -> Result<Self, globset::Error> {
        Ok(PathFilter {
            matcher: Glob::new(pattern)?.compile_matcher(),
        })
    }
}

impl Filter for PathFilter {
    fn matches(&self, req: &Request) -> bool {
        self.matcher.is_match(req.uri().path())
    }
}

pub struct MethodFilter(pub Method);

impl Filter for MethodFilter {
    fn matches(&self, req: &Request) -> bool {
        req.method() == self.0
    }
}

/// Host the request targets: URI authority first, `Host` header as fallback,
/// port dropped either way.
pub(crate) fn request_host(req: &Request) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_string());
    }
    let header = req.headers().get(HOST)?.to_str().ok()?;
    let authority: Authority = header.parse().ok()?;
    Some(authority.host().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::empty;
    use http::HeaderValue;

    fn request_for(uri: &str) -> Request {
        let mut req = Request::new(empty());
        *req.uri_mut() = uri.parse().expect("uri");
        req
    }

    #[test]
    fn host_filter_matches_subdomains() {
        let filter = HostFilter::new("*.example.com").expect("glob");
        assert!(filter.matches(&request_for("http://api.example.com/x")));
        assert!(!filter.matches(&request_for("http://example.org/x")));
    }

    #[test]
    fn host_filter_falls_back_to_host_header() {
        let filter = HostFilter::new("origin.test").expect("glob");
        let mut req = request_for("/path-only");
        req.headers_mut()
            .insert(HOST, HeaderValue::from_static("origin.test:8080"));
        assert!(filter.matches(&req));
    }

    #[test]
    fn path_and_method_filters() {
        let path = PathFilter::new("/api/**").expect("glob");
        assert!(path.matches(&request_for("http://h/api/v1/users")));
        assert!(!path.matches(&request_for("http://h/health")));

        let method = MethodFilter(Method::POST);
        let mut req = request_for("http://h/api");
        assert!(!method.matches(&req));
        *req.method_mut() = Method::POST;
        assert!(method.matches(&req));
    }
}
