use std::ffi::c_char;
use std::ffi::c_int;
use std::ffi::c_void;
use std::ffi::CString;
use std::str::FromStr;

use gdal::cpl::CslStringList;
use gdal::spatial_ref::CoordTransform;
use gdal::spatial_ref::SpatialRef;
use gdal::vector::Geometry;

use crate::errors::CommandError;
use crate::gdal_fixes::GeometryFix;
use crate::layer_source::SourceFeature;
use crate::layer_source::SourceSchema;
use crate::progress::ProgressObserver;
use crate::target_layer::TargetLayerContext;
use crate::translate::TranslateOptions;

#[derive(Clone,Copy,Debug)]
pub(crate) struct GroundControlPoint {
    pub(crate) pixel: f64,
    pub(crate) line: f64,
    pub(crate) x: f64,
    pub(crate) y: f64,
    pub(crate) z: f64,
}

impl FromStr for GroundControlPoint {

    type Err = String;

    // "pixel,line,easting,northing" with an optional fifth elevation value
    fn from_str(text: &str) -> Result<Self,Self::Err> {
        let values: Vec<f64> = text.split(',')
            .map(|part| part.trim().parse().map_err(|_| format!("'{}' is not a number",part)))
            .collect::<Result<Vec<f64>,String>>()?;
        match values.as_slice() {
            [pixel,line,x,y] => Ok(Self { pixel: *pixel, line: *line, x: *x, y: *y, z: 0.0 }),
            [pixel,line,x,y,z] => Ok(Self { pixel: *pixel, line: *line, x: *x, y: *y, z: *z }),
            _ => Err("a ground control point takes 4 or 5 comma-separated values".to_owned())
        }
    }

}

// An empirical transform derived from ground control points, either polynomial
// or thin-plate-spline. It is owned by the translation session and shared
// read-only across every layer, unlike the SRS transforms which live in the
// per-layer context.
pub(crate) struct GcpTransform {
    handle: *mut c_void,
    thin_plate_spline: bool,
}

impl GcpTransform {

    // a negative order requests the thin-plate-spline transformer
    pub(crate) fn new(points: &[GroundControlPoint], order: i32) -> Result<Self,CommandError> {
        let thin_plate_spline = order < 0;
        let blank = CString::new("").map_err(|_| CommandError::GcpTransformCreationFailed)?;
        // the transformers duplicate the list internally
        let raw: Vec<gdal_sys::GDAL_GCP> = points.iter().map(|point| gdal_sys::GDAL_GCP {
            pszId: blank.as_ptr() as *mut c_char,
            pszInfo: blank.as_ptr() as *mut c_char,
            dfGCPPixel: point.pixel,
            dfGCPLine: point.line,
            dfGCPX: point.x,
            dfGCPY: point.y,
            dfGCPZ: point.z,
        }).collect();
        let handle = unsafe {
            if thin_plate_spline {
                gdal_sys::GDALCreateTPSTransformer(raw.len() as c_int, raw.as_ptr(), 0)
            } else {
                gdal_sys::GDALCreateGCPTransformer(raw.len() as c_int, raw.as_ptr(), order, 0)
            }
        };
        if handle.is_null() {
            Err(CommandError::GcpTransformCreationFailed)
        } else {
            Ok(Self {
                handle,
                thin_plate_spline
            })
        }
    }

    fn transform_points(&self, x: &mut [f64], y: &mut [f64], z: &mut [f64]) -> bool {
        let count = x.len();
        let mut success: Vec<c_int> = vec![0; count];
        let overall = unsafe {
            if self.thin_plate_spline {
                gdal_sys::GDALTPSTransform(self.handle, 0, count as c_int, x.as_mut_ptr(), y.as_mut_ptr(), z.as_mut_ptr(), success.as_mut_ptr())
            } else {
                gdal_sys::GDALGCPTransform(self.handle, 0, count as c_int, x.as_mut_ptr(), y.as_mut_ptr(), z.as_mut_ptr(), success.as_mut_ptr())
            }
        };
        (overall != 0) && success.iter().all(|flag| *flag != 0)
    }

    pub(crate) fn apply(&self, geometry: &mut Geometry) -> bool {
        geometry.transform_each_vertex(&mut |x,y,z| self.transform_points(x, y, z))
    }

}

impl Drop for GcpTransform {

    fn drop(&mut self) {
        unsafe {
            if self.thin_plate_spline {
                gdal_sys::GDALDestroyTPSTransformer(self.handle);
            } else {
                gdal_sys::GDALDestroyGCPTransformer(self.handle);
            }
        }
    }

}

// One cached SRS-to-SRS transform, keyed by the source SRS it was built from.
// Replaced, and the old one dropped, whenever the source SRS changes.
pub(crate) struct CachedTransform {
    pub(crate) source_srs: SpatialRef,
    pub(crate) transform: CoordTransform,
}

// Derives or refreshes the coordinate transformation for every destination
// geometry field. Called once at the start of a layer, and again for every
// feature once a layer turns out to carry per-feature spatial references.
pub(crate) fn setup_transforms<Progress: ProgressObserver>(
    context: &mut TargetLayerContext,
    schema: &SourceSchema,
    feature: &SourceFeature,
    options: &TranslateOptions,
    wrap_warning_issued: &mut bool,
    progress: &Progress
) -> Result<(),CommandError> {

    for index in 0..context.dst_geom_fields.len() {

        // which source geometry field feeds this destination field
        let source_index = if let Some(requested) = context.requested_geom_field {
            Some(requested)
        } else {
            match schema.geom_field_index(&context.dst_geom_fields[index].name) {
                Some(found) => Some(found),
                None => if (context.dst_geom_fields.len() == 1) && !schema.geom_fields.is_empty() {
                    Some(0)
                } else {
                    None
                }
            }
        };
        context.src_geom_index[index] = source_index;
        let source_index = match source_index {
            Some(source_index) => source_index,
            None => continue
        };

        let mut source_srs = None;
        if options.reproject || options.wrap_dateline {
            if context.features_read == 0 {
                source_srs = options.source_srs.clone();
                if source_srs.is_none() {
                    source_srs = schema.geom_fields[source_index].srs.clone();
                }
            }
            if source_srs.is_none() {
                if let Some(geometry) = feature.geometries.get(source_index).and_then(Option::as_ref) {
                    source_srs = geometry.spatial_ref();
                }
                // from here on the SRS has to be re-resolved for every feature
                context.per_feature_ct = true;
            }
        }

        if options.reproject {
            if let Some(output_srs) = &options.output_srs {
                let source_srs = source_srs.clone().ok_or_else(|| CommandError::MissingSourceSrs(schema.name.clone()))?;
                let reusable = matches!(&context.transforms[index], Some(cached) if cached.source_srs == source_srs);
                if !reusable {
                    let transform = CoordTransform::new(&source_srs, output_srs).map_err(|_| CommandError::TransformCreationFailed(
                        source_srs.to_pretty_wkt().unwrap_or_default(),
                        output_srs.to_pretty_wkt().unwrap_or_default()
                    ))?;
                    context.transforms[index] = Some(CachedTransform {
                        source_srs,
                        transform
                    });
                }
            }
        }

        if options.wrap_dateline {
            let mut transform_options = Vec::new();
            let wrappable = if options.reproject {
                context.transforms[index].is_some() &&
                    matches!(&options.output_srs, Some(srs) if srs.is_geographic())
            } else {
                matches!(&source_srs, Some(srs) if srs.is_geographic())
            };
            if wrappable {
                transform_options.push(("WRAPDATELINE","YES".to_owned()));
                transform_options.push(("DATELINEOFFSET",options.dateline_offset.clone()));
            } else if !*wrap_warning_issued {
                progress.warning(|| "Dateline wrapping only works when reprojecting to a geographic SRS.");
                *wrap_warning_issued = true;
            }
            context.transform_options[index] = transform_options;
        }

    }

    Ok(())
}

// The composite behavior: ground control points first, then the SRS transform
// together with any dateline options. With neither present the caller is
// expected to just stamp the output SRS on instead.
pub(crate) fn reprojected(mut geometry: Geometry, transform: Option<&CoordTransform>, options: &[(&'static str,String)], gcp_transform: Option<&GcpTransform>) -> Option<Geometry> {
    if let Some(gcp_transform) = gcp_transform {
        if !gcp_transform.apply(&mut geometry) {
            return None;
        }
    }
    if transform.is_some() || !options.is_empty() {
        let mut list = CslStringList::new();
        for (name,value) in options {
            if list.set_name_value(name, value).is_err() {
                return None;
            }
        }
        geometry.transformed_with_options(transform, &list)
    } else {
        Some(geometry)
    }
}
