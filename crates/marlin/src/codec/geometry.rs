//! Geometry decode target: 4-byte SRID followed by WKB.

#![allow(clippy::cast_possible_truncation)]

use marlin_core::geometry::{Geometry, LineString, Point, Polygon, Shape};
use marlin_core::{Error, Result};

use crate::codec::{unsupported, DataType, Decodable};
use crate::message::server::ColumnDefinition;
use crate::protocol::PacketReader;

fn parse_error() -> Error {
    Error::bad_value("<wkb>", "Geometry")
}

fn read_point(buf: &mut PacketReader<'_>) -> Result<Point> {
    let x = buf.read_u64_le().ok_or_else(parse_error)?;
    let y = buf.read_u64_le().ok_or_else(parse_error)?;
    Ok(Point::new(f64::from_bits(x), f64::from_bits(y)))
}

fn read_line(buf: &mut PacketReader<'_>) -> Result<LineString> {
    let count = buf.read_u32_le().ok_or_else(parse_error)? as usize;
    let mut points = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        points.push(read_point(buf)?);
    }
    Ok(LineString { points })
}

fn read_polygon(buf: &mut PacketReader<'_>) -> Result<Polygon> {
    let count = buf.read_u32_le().ok_or_else(parse_error)? as usize;
    let mut rings = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        rings.push(read_line(buf)?);
    }
    Ok(Polygon { rings })
}

/// Parse one WKB geometry, recursing into collections.
fn read_shape(buf: &mut PacketReader<'_>) -> Result<Shape> {
    let byte_order = buf.read_u8().ok_or_else(parse_error)?;
    if byte_order != 1 {
        // The server always emits NDR (little-endian).
        return Err(parse_error());
    }
    let wkb_type = buf.read_u32_le().ok_or_else(parse_error)?;
    match wkb_type {
        1 => Ok(Shape::Point(read_point(buf)?)),
        2 => Ok(Shape::LineString(read_line(buf)?)),
        3 => Ok(Shape::Polygon(read_polygon(buf)?)),
        4 => {
            let count = buf.read_u32_le().ok_or_else(parse_error)? as usize;
            let mut points = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                // Each member is a full WKB point with its own header.
                match read_shape(buf)? {
                    Shape::Point(p) => points.push(p),
                    _ => return Err(parse_error()),
                }
            }
            Ok(Shape::MultiPoint(points))
        }
        5 => {
            let count = buf.read_u32_le().ok_or_else(parse_error)? as usize;
            let mut lines = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                match read_shape(buf)? {
                    Shape::LineString(l) => lines.push(l),
                    _ => return Err(parse_error()),
                }
            }
            Ok(Shape::MultiLineString(lines))
        }
        6 => {
            let count = buf.read_u32_le().ok_or_else(parse_error)? as usize;
            let mut polys = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                match read_shape(buf)? {
                    Shape::Polygon(p) => polys.push(p),
                    _ => return Err(parse_error()),
                }
            }
            Ok(Shape::MultiPolygon(polys))
        }
        7 => {
            let count = buf.read_u32_le().ok_or_else(parse_error)? as usize;
            let mut shapes = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                shapes.push(read_shape(buf)?);
            }
            Ok(Shape::GeometryCollection(shapes))
        }
        _ => Err(parse_error()),
    }
}

impl Decodable for Geometry {
    const TARGET: &'static str = "Geometry";

    fn decode_text(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        let is_geometry = column.data_type() == DataType::Geometry
            || (matches!(
                column.data_type(),
                DataType::Blob | DataType::LongBlob | DataType::MediumBlob | DataType::TinyBlob
            ) && column
                .ext_type_name()
                .is_some_and(|n| {
                    matches!(
                        n,
                        "point"
                            | "linestring"
                            | "polygon"
                            | "multipoint"
                            | "multilinestring"
                            | "multipolygon"
                            | "geometrycollection"
                            | "geometry"
                    )
                }));
        if !is_geometry {
            return Err(unsupported(column, Self::TARGET));
        }

        let mut buf = PacketReader::new(raw);
        let srid = buf.read_u32_le().ok_or_else(parse_error)?;
        let shape = read_shape(&mut buf)?;
        Ok(Geometry { srid, shape })
    }

    fn decode_binary(column: &ColumnDefinition, raw: &[u8]) -> Result<Self> {
        Self::decode_text(column, raw)
    }
}

fn write_point(out: &mut Vec<u8>, p: Point) {
    out.extend_from_slice(&p.x.to_bits().to_le_bytes());
    out.extend_from_slice(&p.y.to_bits().to_le_bytes());
}

fn write_shape(out: &mut Vec<u8>, shape: &Shape) {
    out.push(1); // NDR
    out.extend_from_slice(&shape.wkb_type().to_le_bytes());
    match shape {
        Shape::Point(p) => write_point(out, *p),
        Shape::LineString(l) => {
            out.extend_from_slice(&(l.points.len() as u32).to_le_bytes());
            for p in &l.points {
                write_point(out, *p);
            }
        }
        Shape::Polygon(poly) => {
            out.extend_from_slice(&(poly.rings.len() as u32).to_le_bytes());
            for ring in &poly.rings {
                out.extend_from_slice(&(ring.points.len() as u32).to_le_bytes());
                for p in &ring.points {
                    write_point(out, *p);
                }
            }
        }
        Shape::MultiPoint(points) => {
            out.extend_from_slice(&(points.len() as u32).to_le_bytes());
            for p in points {
                write_shape(out, &Shape::Point(*p));
            }
        }
        Shape::MultiLineString(lines) => {
            out.extend_from_slice(&(lines.len() as u32).to_le_bytes());
            for l in lines {
                write_shape(out, &Shape::LineString(l.clone()));
            }
        }
        Shape::MultiPolygon(polys) => {
            out.extend_from_slice(&(polys.len() as u32).to_le_bytes());
            for p in polys {
                write_shape(out, &Shape::Polygon(p.clone()));
            }
        }
        Shape::GeometryCollection(shapes) => {
            out.extend_from_slice(&(shapes.len() as u32).to_le_bytes());
            for s in shapes {
                write_shape(out, s);
            }
        }
    }
}

/// SRID + WKB encoding used for geometry parameters.
pub fn encode_wkb(geometry: &Geometry) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&geometry.srid.to_le_bytes());
    write_shape(&mut out, &geometry.shape);
    out
}
