//! Diagnostics: every resolution step on its own, at one coordinate

use crate::app::settings::ProbeArgs;
use speed_limit_lib::{LocalLimitStore, RemoteLimitResolver, TransportKind, fallback};

/// Run each step once and print what it returned
pub async fn run_probe(args: &ProbeArgs, resolver: &RemoteLimitResolver, mut store: LocalLimitStore) {
    let (lat, lon) = (args.lat, args.lon);
    println!("Probing {lat:.6}, {lon:.6}");
    println!(
        "  search radius: {}m, acceptance: {}m",
        resolver.search_radius(args.accuracy),
        resolver.config().max_accept_distance_m
    );

    let mut country = args.country.as_deref().map(str::to_ascii_lowercase);
    for kind in TransportKind::all() {
        match resolver.probe_country(kind, lat, lon).await {
            Ok(code) => {
                println!("  {kind} geocode: {code}");
                country.get_or_insert(code);
            }
            Err(e) => println!("  {kind} geocode: failed ({e})"),
        }
    }

    println!("  local databases: {:?} in {}", store.countries(), store.dir().display());
    store.select_country(country.as_deref());
    match store.lookup_hit(lat, lon) {
        Some(hit) => println!(
            "  local-db:{}: {} km/h (box {:?} .. {:?})",
            store.active_country().unwrap_or("?"),
            hit.speed_kmh,
            hit.bounds.min(),
            hit.bounds.max()
        ),
        None => println!("  local-db: no match"),
    }
    store.close();

    for kind in TransportKind::all() {
        match resolver.probe_ways(kind, lat, lon, args.accuracy).await {
            Ok(found) => println!(
                "  {kind} overpass: {} km/h, way {:?} at {:.1}m",
                found.limit_kmh, found.way_id, found.distance_m
            ),
            Err(e) => println!("  {kind} overpass: failed ({e})"),
        }
        if args.raw {
            match resolver.raw_ways_response(kind, lat, lon, args.accuracy).await {
                Ok(body) => println!("  {kind} raw response:\n{body}"),
                Err(e) => println!("  {kind} raw response: failed ({e})"),
            }
        }
    }

    let row = fallback::get(country.as_deref());
    println!(
        "  fallback:{}: urban {} / rural {} / divided {} / motorway {} km/h",
        country.as_deref().unwrap_or("unknown"),
        row.urban,
        row.rural,
        row.divided,
        row.motorway
    );
}
