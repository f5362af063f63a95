//! Edge and region naming for the signaling gateway fleet.

pub const DEFAULT_EDGE: &str = "roaming";

/// Maps a gateway region identifier to its public edge name.
pub fn edge_for_region(region: &str) -> Option<&'static str> {
    Some(match region {
        "gll" => "roaming",
        "au1" => "sydney",
        "br1" => "sao-paulo",
        "de1" => "frankfurt",
        "ie1" => "dublin",
        "jp1" => "tokyo",
        "sg1" => "singapore",
        "us1" => "ashburn",
        "us2" => "umatilla",
        _ => return None,
    })
}

pub fn chunder_host(edge: &str) -> String {
    format!("chunderw-vpc-gll-{edge}.ringline.io")
}

pub fn default_chunder_host() -> String {
    "chunderw-vpc-gll.ringline.io".to_string()
}

pub fn signaling_url(host: &str) -> String {
    format!("wss://{host}/signal")
}

/// Expands the configured edge list into websocket URIs, falling back to
/// the global host when no edges are configured.
pub fn chunder_uris(edges: &[String]) -> Vec<String> {
    if edges.is_empty() {
        return vec![signaling_url(&default_chunder_host())];
    }
    edges
        .iter()
        .map(|edge| signaling_url(&chunder_host(edge)))
        .collect()
}
