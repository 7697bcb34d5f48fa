use std::sync::Arc;

use darpool::dispatch::{Command, DispatchError, MemoryOperations, Outcome, Payload};
use darpool::geo::{Direction, Distance, Location};
use darpool::hex::HexDisplayExt;
use darpool::mesh::{Node, NodeConfig, NodeInfo, ServiceNode, UserNode};
use darpool::model::{Blake3Hasher, PasswordHasher, QueryBuilder, Trip, User};
use futures::future::join_all;
use tracing::info;

fn service_node(name: &str, geo_name: &str, location: Location) -> Arc<ServiceNode> {
    ServiceNode::spawn(
        NodeInfo::new(name)
            .with_geo_name(geo_name)
            .with_location(location),
        Arc::new(MemoryOperations::new()),
        NodeConfig::default(),
    )
}

#[tokio::main]
async fn main() -> Result<(), DispatchError> {
    tracing_subscriber::fmt::init();

    let milan = Location::with_coordinates("Milano", 45.4642, 9.19);
    let turin = Location::with_coordinates("Torino", 45.0703, 7.6869);
    let genoa = Location::with_coordinates("Genova", 44.4056, 8.9463);

    // mi <-> to <-> ge, trips are kept on ge
    let mi = service_node("mi-1", "Milano", milan.clone());
    let to = service_node("to-1", "Torino", turin);
    let ge = service_node("ge-1", "Genova", genoa.clone());
    mi.add_neighbour(&to).await;
    to.add_neighbour(&ge).await;

    let hasher = Blake3Hasher::new();
    let mut profile = User::builder()
        .username("mario")
        .name("Mario Rossi")
        .email("mario@example.org")
        .build();
    profile.set_password(&hasher, "correct horse");
    let mario = UserNode::for_user(profile.clone(), "Porta Garibaldi");
    let sender = mario.id();
    mi.add_user(mario).await;

    let steps = vec![
        Command::register_user(profile),
        Command::join("mario", hasher.hash("correct horse")),
        Command::insert_trip(
            Trip::builder()
                .owner("mario")
                .departure(milan.offset(&Distance::from_kilometers(4.), Direction::South))
                .arrival(genoa.clone())
                .cost(12.)
                .free_seats(3)
                .notes("one stop in Serravalle")
                .build(),
        ),
    ];
    for command in steps {
        let op = command.kind().name();
        let reply = mi.submit(&sender, command.to(ge.id())).await?;
        info!(
            "{} served by {}: {:?}",
            op,
            reply.served_by.hex().short(4),
            reply.outcome
        );
    }

    // a few searches in flight at once
    let searches = [5., 10., 2.].map(|range_km| {
        let query = QueryBuilder::builder()
            .range_km(range_km)
            .departure(milan.clone())
            .arrival(genoa.clone())
            .build();
        mi.submit(&sender, Command::search_trip(query).to(ge.id()))
    });
    for reply in join_all(searches).await {
        match reply?.outcome {
            Outcome::Success(Payload::TripsFound { query_id, trips }) => {
                info!("query {} found {} trips", query_id.hex(), trips.len());
                for trip in trips {
                    println!("{}", trip);
                }
            }
            other => info!("search failed: {:?}", other),
        }
    }

    let reply = mi.submit(&sender, Command::unjoin("mario").to(ge.id())).await?;
    info!("unjoin: {:?}", reply.outcome);

    Ok(())
}
