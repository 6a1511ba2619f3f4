/// DNS-SD meta-query type; browsing it enumerates every advertised service type
pub const META_QUERY_TYPE: &str = "_services._dns-sd._udp";

/// Default mDNS browse domain
pub const DEFAULT_DOMAIN: &str = "local.";

/// API path prefix
pub const API_PREFIX: &str = "/v1";

/// Joins a service type and a browse domain into a fully qualified type,
/// e.g. "_ipp._tcp" + "local." -> "_ipp._tcp.local."
pub fn qualified_type(service_type: &str, domain: &str) -> String {
    let service_type = service_type.trim_end_matches('.');
    let domain = domain.trim_start_matches('.');
    if domain.ends_with('.') {
        format!("{}.{}", service_type, domain)
    } else {
        format!("{}.{}.", service_type, domain)
    }
}
