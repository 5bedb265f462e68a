use gdal::vector::FieldValue;
use gdal::vector::Geometry;
use gdal::vector::OGRFieldType;

use crate::errors::CommandError;
use crate::layer_source::AttributeField;
use crate::layer_source::FeatureSource;
use crate::layer_source::SourceFeature;
use crate::layer_source::SourceSchema;
use crate::progress::ProgressObserver;

// One entry per multi-valued source field: how many scalar slots it flattens
// into, and how wide the strings were.
struct ListFieldDesc {
    source_index: usize,
    field_type: OGRFieldType::Type,
    max_occurrences: usize,
    width: i32,
}

fn is_list_type(field_type: OGRFieldType::Type) -> bool {
    matches!(field_type,
        OGRFieldType::OFTIntegerList |
        OGRFieldType::OFTInteger64List |
        OGRFieldType::OFTRealList |
        OGRFieldType::OFTStringList)
}

fn scalar_type_for(field_type: OGRFieldType::Type) -> OGRFieldType::Type {
    match field_type {
        OGRFieldType::OFTIntegerList => OGRFieldType::OFTInteger,
        OGRFieldType::OFTInteger64List => OGRFieldType::OFTInteger64,
        OGRFieldType::OFTRealList => OGRFieldType::OFTReal,
        _ => OGRFieldType::OFTString
    }
}

pub(crate) enum SplitOutcome<Source: FeatureSource> {
    Split(SplitListSource<Source>),
    // the source had no list fields, so the caller gets it back untouched
    NoListFields(Source)
}

// Wraps a feature source, presenting a derived schema in which every list
// field has been flattened into a bounded run of scalar fields. Building it
// requires a full scan of the source, since the run length is the maximum
// number of values actually observed.
pub(crate) struct SplitListSource<Source: FeatureSource> {
    source: Source,
    schema: SourceSchema,
    descriptors: Vec<ListFieldDesc>,
    max_subfields: usize,
}

impl<Source: FeatureSource> SplitListSource<Source> {

    pub(crate) fn build<Progress: ProgressObserver>(mut source: Source, max_subfields: Option<usize>, progress: &mut Progress) -> Result<SplitOutcome<Source>,CommandError> {
        let max_subfields = max_subfields.unwrap_or(usize::MAX);
        let mut descriptors: Vec<ListFieldDesc> = source.schema().fields.iter().enumerate().filter_map(|(index,field)| {
            if is_list_type(field.field_type) {
                Some(ListFieldDesc {
                    source_index: index,
                    field_type: field.field_type,
                    // with a cap of one there is nothing to measure
                    max_occurrences: if max_subfields == 1 { 1 } else { 0 },
                    width: 0
                })
            } else {
                None
            }
        }).collect();

        if descriptors.is_empty() {
            return Ok(SplitOutcome::NoListFields(source));
        }

        if max_subfields != 1 {
            let feature_count = source.estimated_feature_count();
            progress.start(|| ("Scanning list fields.",feature_count.map(|count| count as usize)));
            source.rewind();
            let mut scanned = 0;
            while let Some(feature) = source.next_feature()? {
                for descriptor in &mut descriptors {
                    let mut count = match feature.fields.get(descriptor.source_index).and_then(Option::as_ref) {
                        Some(FieldValue::IntegerListValue(values)) => values.len(),
                        Some(FieldValue::Integer64ListValue(values)) => values.len(),
                        Some(FieldValue::RealListValue(values)) => values.len(),
                        Some(FieldValue::StringListValue(values)) => {
                            for value in values {
                                let width = value.len() as i32;
                                if width > descriptor.width {
                                    descriptor.width = width;
                                }
                            }
                            values.len()
                        },
                        _ => 0
                    };
                    if count > descriptor.max_occurrences {
                        if count > max_subfields {
                            count = max_subfields;
                        }
                        descriptor.max_occurrences = count;
                    }
                }
                scanned += 1;
                progress.update(|| scanned);
            }
            progress.finish(|| "List fields scanned.");
            source.rewind();
        }

        let schema = Self::derive_schema(source.schema(), &descriptors);

        Ok(SplitOutcome::Split(Self {
            source,
            schema,
            descriptors,
            max_subfields
        }))
    }

    fn derive_schema(source: &SourceSchema, descriptors: &[ListFieldDesc]) -> SourceSchema {
        let mut fields = Vec::new();
        for (index,field) in source.fields.iter().enumerate() {
            if let Some(descriptor) = descriptors.iter().find(|descriptor| descriptor.source_index == index) {
                let field_type = scalar_type_for(descriptor.field_type);
                if descriptor.max_occurrences == 1 {
                    fields.push(AttributeField {
                        name: field.name.clone(),
                        field_type,
                        width: 0,
                        precision: 0
                    });
                } else {
                    // a field that never held a value flattens into nothing
                    for subfield in 1..=descriptor.max_occurrences {
                        fields.push(AttributeField {
                            name: format!("{}{}",field.name,subfield),
                            field_type,
                            width: descriptor.width,
                            precision: 0
                        });
                    }
                }
            } else {
                fields.push(field.clone());
            }
        }
        SourceSchema {
            name: source.name.clone(),
            fields,
            geom_fields: source.geom_fields.clone()
        }
    }

    fn expand<Value>(fields: &mut Vec<Option<FieldValue>>, slots: usize, cap: usize, values: Vec<Value>, wrap: impl Fn(Value) -> FieldValue) {
        let mut filled = 0;
        // anything beyond the observed or configured maximum is dropped silently
        for value in values.into_iter().take(cap.min(slots)) {
            fields.push(Some(wrap(value)));
            filled += 1;
        }
        for _ in filled..slots {
            fields.push(None);
        }
    }

    fn translate_feature(&self, mut feature: SourceFeature) -> SourceFeature {
        let mut fields = Vec::with_capacity(self.schema.fields.len());
        let mut descriptors = self.descriptors.iter().peekable();
        for (index,value) in feature.fields.drain(..).enumerate() {
            let descriptor = match descriptors.peek() {
                Some(descriptor) if descriptor.source_index == index => descriptors.next(),
                _ => None
            };
            if let Some(descriptor) = descriptor {
                let slots = descriptor.max_occurrences;
                match value {
                    Some(FieldValue::IntegerListValue(values)) => Self::expand(&mut fields, slots, self.max_subfields, values, FieldValue::IntegerValue),
                    Some(FieldValue::Integer64ListValue(values)) => Self::expand(&mut fields, slots, self.max_subfields, values, FieldValue::Integer64Value),
                    Some(FieldValue::RealListValue(values)) => Self::expand(&mut fields, slots, self.max_subfields, values, FieldValue::RealValue),
                    Some(FieldValue::StringListValue(values)) => Self::expand(&mut fields, slots, self.max_subfields, values, FieldValue::StringValue),
                    _ => Self::expand(&mut fields, slots, self.max_subfields, Vec::new(), |value: i32| FieldValue::IntegerValue(value))
                }
            } else {
                fields.push(value);
            }
        }
        SourceFeature {
            fid: feature.fid,
            fields,
            geometries: feature.geometries
        }
    }

}

impl<Source: FeatureSource> FeatureSource for SplitListSource<Source> {

    fn schema(&self) -> &SourceSchema {
        &self.schema
    }

    fn rewind(&mut self) {
        self.source.rewind()
    }

    fn next_feature(&mut self) -> Result<Option<SourceFeature>,CommandError> {
        Ok(self.source.next_feature()?.map(|feature| self.translate_feature(feature)))
    }

    fn feature_by_id(&mut self, fid: u64) -> Result<Option<SourceFeature>,CommandError> {
        Ok(self.source.feature_by_id(fid)?.map(|feature| self.translate_feature(feature)))
    }

    fn estimated_feature_count(&self) -> Option<u64> {
        self.source.estimated_feature_count()
    }

    fn set_attribute_filter(&mut self, filter: &str) -> Result<(),CommandError> {
        self.source.set_attribute_filter(filter)
    }

    fn set_spatial_filter(&mut self, geometry: &Geometry) {
        self.source.set_spatial_filter(geometry)
    }

    fn ignore_fields(&mut self, _: &[String]) -> Result<bool,CommandError> {
        // the generated fields don't correspond to anything the wrapped layer
        // could ignore
        Ok(false)
    }

}
