//! Map-view target exposed by the peer binary.

use peerlink::{MethodRegistry, MethodSignature, ProtocolTable, Result, RpcTarget};
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize)]
pub struct Annotation {
    pub ann_type: String,
    pub coordinates: Value,
    pub meta: Value,
}

#[derive(Debug, Default, Serialize)]
pub struct MapState {
    pub center: Option<[f64; 3]>,
    pub annotations: Vec<Annotation>,
    #[serde(skip)]
    pub protocol: ProtocolTable,
}

pub type MapTarget = MethodRegistry<MapState>;

/// Build the map target and record its own protocol table for `get_protocol`.
pub fn map_target() -> Result<MapTarget> {
    let mut target = MethodRegistry::new(MapState::default())
        .method(MethodSignature::declare("get_protocol", ""), |map, _| {
            Ok(serde_json::to_value(&map.protocol)?)
        })
        .method(MethodSignature::declare("set_center", "x, y, z"), |map, args| {
            let center = [args.get("x")?, args.get("y")?, args.get("z")?];
            map.center = Some(center);
            Ok(json!(center))
        })
        .method(
            MethodSignature::declare("add_annotation", "ann_type, coordinates, meta={}"),
            |map, args| {
                map.annotations.push(Annotation {
                    ann_type: args.get("ann_type")?,
                    coordinates: args.get("coordinates")?,
                    meta: args.get("meta")?,
                });
                Ok(json!(true))
            },
        )
        .method(MethodSignature::declare("get_map_state", ""), |map, _| {
            Ok(serde_json::to_value(&*map)?)
        });

    let protocol = target.protocol()?;
    target.state_mut().protocol = protocol;
    Ok(target)
}
