use std::path::Path;

use gdal::vector::Geometry;
use gdal::vector::LayerAccess;
use gdal::vector::OGRwkbGeometryType;
use gdal::vector::sql;
use gdal::Dataset;

use crate::errors::CommandError;
use crate::gdal_fixes::LayerFix;
use crate::geometry::flattened;

// Builds a single clip operand by unioning every polygon found in the given
// datasource into one multipolygon. Anything that isn't a polygon aborts the
// load, since clipping against lines or points doesn't mean anything here.
pub(crate) fn load_clip_geometry(path: &Path, sql_statement: Option<&str>, layer_name: Option<&str>, attribute_filter: Option<&str>, side: &'static str) -> Result<Option<Geometry>,CommandError> {

    let dataset = Dataset::open(path)?;

    if let Some(sql_statement) = sql_statement {
        let mut layer = dataset.execute_sql(sql_statement, None, sql::Dialect::DEFAULT)?
            .ok_or_else(|| CommandError::ClipLayerNotFound(path.display().to_string()))?;
        aggregate_polygons(&mut *layer, attribute_filter, side)
    } else if let Some(layer_name) = layer_name {
        let mut layer = dataset.layer_by_name(layer_name)
            .map_err(|_| CommandError::ClipLayerNotFound(path.display().to_string()))?;
        aggregate_polygons(&mut layer, attribute_filter, side)
    } else {
        let mut layer = dataset.layer(0)
            .map_err(|_| CommandError::ClipLayerNotFound(path.display().to_string()))?;
        aggregate_polygons(&mut layer, attribute_filter, side)
    }

}

pub(crate) fn aggregate_polygons<SomeLayer: LayerAccess>(layer: &mut SomeLayer, attribute_filter: Option<&str>, side: &'static str) -> Result<Option<Geometry>,CommandError> {

    if let Some(attribute_filter) = attribute_filter {
        layer.set_attribute_filter(attribute_filter)?;
    }

    let mut combined: Option<Geometry> = None;

    layer.rewind();
    while let Some(feature) = layer.pull_next_feature() {
        let geometry = match feature.geometry() {
            Some(geometry) => geometry,
            None => continue
        };
        if combined.is_none() {
            combined = Some(Geometry::empty(OGRwkbGeometryType::wkbMultiPolygon)?);
        }
        if let Some(combined) = combined.as_mut() {
            match flattened(geometry.geometry_type()) {
                OGRwkbGeometryType::wkbPolygon => combined.add_geometry(geometry.clone())?,
                OGRwkbGeometryType::wkbMultiPolygon => {
                    for index in 0..geometry.geometry_count() {
                        combined.add_geometry(geometry.get_geometry(index).clone())?;
                    }
                },
                _ => return Err(CommandError::InvalidClipGeometry(side))
            }
        }
    }

    Ok(combined)
}
