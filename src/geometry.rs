use gdal::vector::OGRwkbGeometryType;

use crate::errors::CommandError;

// The old 2.5D flag from ogr_core.h. The gdal crate exposes the 25D type
// constants but not the bit itself.
const WKB_25D_BIT: OGRwkbGeometryType::Type = 0x8000_0000;

pub(crate) fn flattened(geometry_type: OGRwkbGeometryType::Type) -> OGRwkbGeometryType::Type {
    geometry_type & !WKB_25D_BIT
}

pub(crate) fn is_3d(geometry_type: OGRwkbGeometryType::Type) -> bool {
    (geometry_type & WKB_25D_BIT) != 0
}

fn with_3d(geometry_type: OGRwkbGeometryType::Type, three_d: bool) -> OGRwkbGeometryType::Type {
    if three_d {
        geometry_type | WKB_25D_BIT
    } else {
        geometry_type & !WKB_25D_BIT
    }
}

// line -> multi-line and polygon -> multi-polygon, anything else passes through.
pub(crate) fn promoted_to_multi(geometry_type: OGRwkbGeometryType::Type) -> OGRwkbGeometryType::Type {
    let three_d = is_3d(geometry_type);
    match flattened(geometry_type) {
        OGRwkbGeometryType::wkbLineString => with_3d(OGRwkbGeometryType::wkbMultiLineString, three_d),
        OGRwkbGeometryType::wkbPolygon => with_3d(OGRwkbGeometryType::wkbMultiPolygon, three_d),
        _ => geometry_type
    }
}

// When collections are exploded the created layer holds the part type, not the
// container type. A generic collection can hold anything, so it demotes to unknown.
pub(crate) fn demoted_for_explosion(geometry_type: OGRwkbGeometryType::Type) -> OGRwkbGeometryType::Type {
    let three_d = is_3d(geometry_type);
    match flattened(geometry_type) {
        OGRwkbGeometryType::wkbMultiPoint => with_3d(OGRwkbGeometryType::wkbPoint, three_d),
        OGRwkbGeometryType::wkbMultiLineString => with_3d(OGRwkbGeometryType::wkbLineString, three_d),
        OGRwkbGeometryType::wkbMultiPolygon => with_3d(OGRwkbGeometryType::wkbPolygon, three_d),
        OGRwkbGeometryType::wkbGeometryCollection => with_3d(OGRwkbGeometryType::wkbUnknown, three_d),
        _ => geometry_type
    }
}

pub(crate) fn is_collection_type(geometry_type: OGRwkbGeometryType::Type) -> bool {
    matches!(flattened(geometry_type),
        OGRwkbGeometryType::wkbMultiPoint |
        OGRwkbGeometryType::wkbMultiLineString |
        OGRwkbGeometryType::wkbMultiPolygon |
        OGRwkbGeometryType::wkbGeometryCollection)
}

#[derive(Clone,Copy,Debug,PartialEq)]
pub(crate) enum CoordinateDimension {
    Unchanged,
    Two,
    Three,
    // take whatever dimensionality the destination geometry field declares
    MatchLayer
}

impl CoordinateDimension {

    pub(crate) fn parse(text: &str) -> Result<Self,CommandError> {
        match text {
            "2" => Ok(Self::Two),
            "3" => Ok(Self::Three),
            "layer_dim" => Ok(Self::MatchLayer),
            _ => Err(CommandError::InvalidCoordinateDimension(text.to_owned()))
        }
    }

}

pub(crate) fn forced_dimension(geometry_type: OGRwkbGeometryType::Type, dimension: CoordinateDimension) -> OGRwkbGeometryType::Type {
    if geometry_type == OGRwkbGeometryType::wkbNone {
        return geometry_type;
    }
    match dimension {
        CoordinateDimension::Two => with_3d(geometry_type, false),
        CoordinateDimension::Three => with_3d(geometry_type, true),
        CoordinateDimension::Unchanged | CoordinateDimension::MatchLayer => geometry_type
    }
}

#[derive(Clone,Copy,Debug,PartialEq)]
pub(crate) enum GeometryOperation {
    NoOp,
    // insert vertices so no segment exceeds the given distance
    Segmentize(f64),
    // Douglas-Peucker simplification bounded by a tolerance, without introducing
    // self-intersections
    SimplifyPreserveTopology(f64)
}

pub(crate) fn geometry_type_from_name(name: &str) -> Result<OGRwkbGeometryType::Type,CommandError> {
    let upper = name.to_uppercase();
    let (base,three_d) = match upper.strip_suffix("25D") {
        Some(base) => (base,true),
        None => (upper.as_str(),false)
    };
    let geometry_type = match base {
        "NONE" => OGRwkbGeometryType::wkbNone,
        "GEOMETRY" => OGRwkbGeometryType::wkbUnknown,
        "POINT" => OGRwkbGeometryType::wkbPoint,
        "LINESTRING" => OGRwkbGeometryType::wkbLineString,
        "POLYGON" => OGRwkbGeometryType::wkbPolygon,
        "GEOMETRYCOLLECTION" => OGRwkbGeometryType::wkbGeometryCollection,
        "MULTIPOINT" => OGRwkbGeometryType::wkbMultiPoint,
        "MULTILINESTRING" => OGRwkbGeometryType::wkbMultiLineString,
        "MULTIPOLYGON" => OGRwkbGeometryType::wkbMultiPolygon,
        _ => return Err(CommandError::InvalidGeometryType(name.to_owned()))
    };
    if three_d && geometry_type != OGRwkbGeometryType::wkbNone {
        Ok(geometry_type | WKB_25D_BIT)
    } else {
        Ok(geometry_type)
    }
}
