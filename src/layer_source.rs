use gdal::vector::Feature;
use gdal::vector::FieldValue;
use gdal::vector::Geometry;
use gdal::vector::Layer;
use gdal::vector::LayerAccess;
use gdal::vector::LayerCaps;
use gdal::vector::OGRFieldType;
use gdal::vector::OGRwkbGeometryType;
use gdal::vector::sql::ResultSet;
use gdal::spatial_ref::SpatialRef;

use crate::errors::CommandError;
use crate::gdal_fixes::LayerFix;

#[derive(Clone)]
pub(crate) struct AttributeField {
    pub(crate) name: String,
    pub(crate) field_type: OGRFieldType::Type,
    pub(crate) width: i32,
    pub(crate) precision: i32,
}

#[derive(Clone)]
pub(crate) struct GeometryField {
    pub(crate) name: String,
    pub(crate) geometry_type: OGRwkbGeometryType::Type,
    pub(crate) srs: Option<SpatialRef>,
}

// A snapshot of a layer's definition. Everything the reconciler and the
// translation loop need to know about a schema is read once up front, which
// also keeps the borrow of the underlying layer short.
pub(crate) struct SourceSchema {
    pub(crate) name: String,
    pub(crate) fields: Vec<AttributeField>,
    pub(crate) geom_fields: Vec<GeometryField>,
}

impl SourceSchema {

    pub(crate) fn from_layer<SomeLayer: LayerAccess>(layer: &SomeLayer) -> Self {
        let defn = layer.defn();
        let fields = defn.fields().map(|field| AttributeField {
            name: field.name(),
            field_type: field.field_type(),
            width: field.width(),
            precision: field.precision()
        }).collect();
        let geom_fields = defn.geom_fields().map(|field| GeometryField {
            name: field.name(),
            geometry_type: field.field_type(),
            srs: field.spatial_ref().ok()
        }).collect();
        Self {
            name: layer.name(),
            fields,
            geom_fields
        }
    }

    // OGR's GetFieldIndex probes exact names first and falls back to a
    // case-insensitive match, so the snapshot does the same.
    pub(crate) fn field_index(&self, name: &str) -> Option<usize> {
        if let Some(index) = self.fields.iter().position(|field| field.name == name) {
            return Some(index);
        }
        self.fields.iter().position(|field| field.name.eq_ignore_ascii_case(name))
    }

    pub(crate) fn geom_field_index(&self, name: &str) -> Option<usize> {
        if let Some(index) = self.geom_fields.iter().position(|field| field.name == name) {
            return Some(index);
        }
        self.geom_fields.iter().position(|field| field.name.eq_ignore_ascii_case(name))
    }

}

// An owned copy of one source feature, detached from the layer that produced it.
pub(crate) struct SourceFeature {
    pub(crate) fid: Option<u64>,
    pub(crate) fields: Vec<Option<FieldValue>>,
    pub(crate) geometries: Vec<Option<Geometry>>,
}

impl SourceFeature {

    fn materialize(feature: &Feature, schema: &SourceSchema) -> Self {
        let mut fields = Vec::with_capacity(schema.fields.len());
        for field in &schema.fields {
            // types the crate can't read (binary for one) come through as null
            fields.push(feature.field_index(&field.name).ok().and_then(|idx| feature.field(idx).ok().flatten()));
        }
        let mut geometries = Vec::with_capacity(schema.geom_fields.len());
        for index in 0..schema.geom_fields.len() {
            geometries.push(feature.geometry_by_index(index).ok().cloned());
        }
        Self {
            fid: feature.fid(),
            fields,
            geometries
        }
    }

    pub(crate) fn take_geometry(&mut self, index: usize) -> Option<Geometry> {
        self.geometries.get_mut(index).and_then(Option::take)
    }

    pub(crate) fn field_as_double(&self, index: usize) -> f64 {
        match self.fields.get(index).and_then(Option::as_ref) {
            Some(FieldValue::IntegerValue(value)) => f64::from(*value),
            Some(FieldValue::Integer64Value(value)) => *value as f64,
            Some(FieldValue::RealValue(value)) => *value,
            Some(FieldValue::StringValue(value)) => value.trim().parse().unwrap_or(0.0),
            _ => 0.0
        }
    }

}

// The capability interface the translation loop reads from. A plain layer, a
// SQL result set and the list-splitting adapter all come through here, so the
// loop never has to care which one it was handed.
pub(crate) trait FeatureSource {

    fn schema(&self) -> &SourceSchema;

    fn rewind(&mut self);

    fn next_feature(&mut self) -> Result<Option<SourceFeature>,CommandError>;

    fn feature_by_id(&mut self, fid: u64) -> Result<Option<SourceFeature>,CommandError>;

    // only answered when the layer can count without scanning
    fn estimated_feature_count(&self) -> Option<u64>;

    fn set_attribute_filter(&mut self, filter: &str) -> Result<(),CommandError>;

    fn set_spatial_filter(&mut self, geometry: &Geometry);

    // returns false when the source can't ignore fields, which is fine
    fn ignore_fields(&mut self, names: &[String]) -> Result<bool,CommandError>;

}

pub(crate) enum SourceLayer<'layer> {
    Plain(Layer<'layer>),
    SqlResult(ResultSet<'layer>)
}

impl<'layer> SourceLayer<'layer> {

    fn layer(&self) -> &Layer<'layer> {
        match self {
            Self::Plain(layer) => layer,
            Self::SqlResult(result) => &**result
        }
    }

    fn layer_mut(&mut self) -> &mut Layer<'layer> {
        match self {
            Self::Plain(layer) => layer,
            Self::SqlResult(result) => &mut **result
        }
    }

}

pub(crate) struct LayerSource<'layer> {
    layer: SourceLayer<'layer>,
    schema: SourceSchema,
}

impl<'layer> LayerSource<'layer> {

    pub(crate) fn from_layer(layer: Layer<'layer>) -> Self {
        let schema = SourceSchema::from_layer(&layer);
        Self {
            layer: SourceLayer::Plain(layer),
            schema
        }
    }

    pub(crate) fn from_result_set(result: ResultSet<'layer>) -> Self {
        let schema = SourceSchema::from_layer(&*result);
        Self {
            layer: SourceLayer::SqlResult(result),
            schema
        }
    }

}

impl FeatureSource for LayerSource<'_> {

    fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    fn rewind(&mut self) {
        self.layer.layer_mut().rewind()
    }

    fn next_feature(&mut self) -> Result<Option<SourceFeature>,CommandError> {
        let layer = self.layer.layer_mut();
        match layer.pull_next_feature() {
            Some(feature) => Ok(Some(SourceFeature::materialize(&feature, &self.schema))),
            None => Ok(None)
        }
    }

    fn feature_by_id(&mut self, fid: u64) -> Result<Option<SourceFeature>,CommandError> {
        let layer = self.layer.layer();
        Ok(layer.feature(fid).map(|feature| SourceFeature::materialize(&feature, &self.schema)))
    }

    fn estimated_feature_count(&self) -> Option<u64> {
        let layer = self.layer.layer();
        if layer.has_capability(LayerCaps::OLCFastFeatureCount) {
            Some(layer.feature_count())
        } else {
            None
        }
    }

    fn set_attribute_filter(&mut self, filter: &str) -> Result<(),CommandError> {
        Ok(self.layer.layer_mut().set_attribute_filter(filter)?)
    }

    fn set_spatial_filter(&mut self, geometry: &Geometry) {
        self.layer.layer_mut().set_spatial_filter(geometry)
    }

    fn ignore_fields(&mut self, names: &[String]) -> Result<bool,CommandError> {
        let layer = self.layer.layer_mut();
        if layer.has_capability(LayerCaps::OLCIgnoreFields) {
            layer.set_ignored_field_names(names)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

}
