//! DXF 实体到 `geo` 几何的代理：曲线离散、多边形有效性检查与 GeoJSON 输出。
//!
//! 所有函数都在图纸 WCS 中工作，坐标转换由调用方完成。

use std::f64::consts::TAU;

use geo::algorithm::line_intersection::{LineIntersection, line_intersection};
use geo::{
    Area, Coord, Geometry, GeometryCollection, Line, LineString, MultiLineString, MultiPoint,
    MultiPolygon, Point, Polygon,
};
use glam::DVec2;
use serde_json::{Value, json};

use geocad_core::document::{
    Arc, Circle, Ellipse, Entity, Hatch, HatchEdge, HatchLoop, Polyline, Spline, ThreeDFace,
};

/// 单段圆弧的最大离散段数。
const MAX_SEGMENTS: usize = 1024;
/// 整圆至少离散为多少段。
const MIN_CIRCLE_SEGMENTS: usize = 8;
const EPSILON: f64 = 1e-9;

/// 构造实体的几何代理。块参照由提取器展开，这里返回 `None`。
pub fn entity_geometry(entity: &Entity, tolerance: f64) -> Option<Geometry<f64>> {
    match entity {
        Entity::Point(point) => Some(Geometry::Point(Point::from(coord(point.location.as_vec2())))),
        Entity::Line(line) => {
            let points = vec![line.start.as_vec2(), line.end.as_vec2()];
            linear(points, false)
        }
        Entity::Polyline(polyline) => polyline_geometry(polyline, tolerance),
        Entity::Face3D(face) => face_geometry(face),
        Entity::Circle(circle) => circle_geometry(circle, tolerance),
        Entity::Arc(arc) => arc_geometry(arc, tolerance),
        Entity::Ellipse(ellipse) => ellipse_geometry(ellipse, tolerance),
        Entity::Spline(spline) => spline_geometry(spline),
        Entity::Hatch(hatch) => hatch_geometry(hatch, tolerance),
        Entity::BlockReference(_) => None,
    }
}

fn coord(point: DVec2) -> Coord<f64> {
    Coord {
        x: point.x,
        y: point.y,
    }
}

/// 去掉相邻重复点后构造线或面。点数不足时退化为更低维的几何。
fn linear(points: Vec<DVec2>, closed: bool) -> Option<Geometry<f64>> {
    let mut points = dedup(points);
    if closed && points.len() > 1 && points[0].abs_diff_eq(points[points.len() - 1], EPSILON) {
        points.pop();
    }
    match points.len() {
        0 => None,
        1 => Some(Geometry::Point(Point::from(coord(points[0])))),
        2 => Some(Geometry::LineString(line_string(&points))),
        _ if closed => Some(Geometry::Polygon(Polygon::new(ring(&points), Vec::new()))),
        _ => Some(Geometry::LineString(line_string(&points))),
    }
}

fn dedup(points: Vec<DVec2>) -> Vec<DVec2> {
    let mut result: Vec<DVec2> = Vec::with_capacity(points.len());
    for point in points {
        if result
            .last()
            .is_none_or(|last| !last.abs_diff_eq(point, EPSILON))
        {
            result.push(point);
        }
    }
    result
}

fn line_string(points: &[DVec2]) -> LineString<f64> {
    LineString::new(points.iter().copied().map(coord).collect())
}

/// 闭合环：首尾点相同。
fn ring(points: &[DVec2]) -> LineString<f64> {
    let mut coords: Vec<Coord<f64>> = points.iter().copied().map(coord).collect();
    if let Some(first) = coords.first().copied() {
        coords.push(first);
    }
    LineString::new(coords)
}

/// 以最大弦高 `tolerance` 离散圆弧所需的段数。
pub fn arc_segments(radius: f64, sweep: f64, tolerance: f64) -> usize {
    let sweep = sweep.abs();
    if radius <= EPSILON || sweep <= EPSILON {
        return 1;
    }
    let ratio = (1.0 - tolerance / radius).clamp(-1.0, 1.0);
    let step = 2.0 * ratio.acos();
    let segments = if step > EPSILON {
        (sweep / step).ceil() as usize
    } else {
        MAX_SEGMENTS
    };
    segments.clamp(1, MAX_SEGMENTS)
}

/// 圆弧上的点，`sweep` 为带符号角（逆时针为正），包含两个端点。
fn arc_points(center: DVec2, radius: f64, start: f64, sweep: f64, tolerance: f64) -> Vec<DVec2> {
    let mut segments = arc_segments(radius, sweep, tolerance);
    if (sweep.abs() - TAU).abs() < EPSILON {
        segments = segments.max(MIN_CIRCLE_SEGMENTS);
    }
    (0..=segments)
        .map(|index| {
            let angle = start + sweep * index as f64 / segments as f64;
            center + radius * DVec2::new(angle.cos(), angle.sin())
        })
        .collect()
}

/// 逆时针从 `start` 到 `end` 的扫角，范围 (0, 2π]。
fn ccw_sweep(start: f64, end: f64) -> f64 {
    let sweep = (end - start).rem_euclid(TAU);
    if sweep <= EPSILON { TAU } else { sweep }
}

/// bulge 段离散后的点（不含起点）。
fn bulge_points(start: DVec2, end: DVec2, bulge: f64, tolerance: f64) -> Vec<DVec2> {
    let chord = end - start;
    let length = chord.length();
    if bulge.abs() < EPSILON || length < EPSILON {
        return vec![end];
    }
    let sweep = 4.0 * bulge.atan();
    let radius = length / (2.0 * (sweep / 2.0).sin().abs());
    let offset = (1.0 - bulge * bulge) / (4.0 * bulge);
    let center = (start + end) * 0.5 + chord.perp() * offset;
    let start_angle = (start - center).to_angle();
    let mut points = arc_points(center, radius, start_angle, sweep, tolerance);
    points.remove(0);
    if let Some(last) = points.last_mut() {
        *last = end;
    }
    points
}

fn polyline_geometry(polyline: &Polyline, tolerance: f64) -> Option<Geometry<f64>> {
    let vertices = &polyline.vertices;
    let first = vertices.first()?;
    let mut points = vec![first.position.as_vec2()];
    let count = vertices.len();
    let segments = if polyline.is_closed { count } else { count - 1 };
    for index in 0..segments {
        let from = &vertices[index];
        let to = &vertices[(index + 1) % count];
        points.extend(bulge_points(
            from.position.as_vec2(),
            to.position.as_vec2(),
            from.bulge,
            tolerance,
        ));
    }
    linear(points, polyline.is_closed)
}

fn face_geometry(face: &ThreeDFace) -> Option<Geometry<f64>> {
    let points: Vec<DVec2> = face
        .vertices
        .iter()
        .map(|vertex| vertex.truncate().as_vec2())
        .collect();
    linear(points, true)
}

fn circle_geometry(circle: &Circle, tolerance: f64) -> Option<Geometry<f64>> {
    if circle.radius <= EPSILON {
        return linear(vec![circle.center.as_vec2()], false);
    }
    let mut points = arc_points(circle.center.as_vec2(), circle.radius, 0.0, TAU, tolerance);
    points.pop();
    linear(points, true)
}

fn arc_geometry(arc: &Arc, tolerance: f64) -> Option<Geometry<f64>> {
    let sweep = ccw_sweep(arc.start_angle, arc.end_angle);
    let points = arc_points(arc.center.as_vec2(), arc.radius, arc.start_angle, sweep, tolerance);
    linear(points, false)
}

fn ellipse_points(
    center: DVec2,
    major: DVec2,
    ratio: f64,
    start: f64,
    sweep: f64,
    tolerance: f64,
) -> Vec<DVec2> {
    let minor = major.perp() * ratio;
    let segments = arc_segments(major.length(), sweep, tolerance).max(MIN_CIRCLE_SEGMENTS);
    (0..=segments)
        .map(|index| {
            let t = start + sweep * index as f64 / segments as f64;
            center + major * t.cos() + minor * t.sin()
        })
        .collect()
}

fn ellipse_geometry(ellipse: &Ellipse, tolerance: f64) -> Option<Geometry<f64>> {
    let full = ellipse.is_full();
    let sweep = if full {
        TAU
    } else {
        ccw_sweep(ellipse.start_parameter, ellipse.end_parameter)
    };
    let mut points = ellipse_points(
        ellipse.center.as_vec2(),
        ellipse.major_axis.as_vec2(),
        ellipse.ratio,
        ellipse.start_parameter,
        sweep,
        tolerance,
    );
    if full {
        points.pop();
    }
    linear(points, full)
}

/// 有拟合点时直接连接拟合点，否则按 NURBS 定义求值。
fn spline_geometry(spline: &Spline) -> Option<Geometry<f64>> {
    let points: Vec<DVec2> = if spline.fit_points.len() >= 2 {
        spline.fit_points.iter().map(|point| point.as_vec2()).collect()
    } else {
        evaluate_nurbs(spline)
    };
    linear(points, spline.is_closed)
}

/// 按控制点数取样的 NURBS 曲线。节点向量缺失或长度不符时使用夹紧均匀节点。
pub fn evaluate_nurbs(spline: &Spline) -> Vec<DVec2> {
    let control: Vec<DVec2> = spline
        .control_points
        .iter()
        .map(|point| point.as_vec2())
        .collect();
    let count = control.len();
    if count < 2 {
        return control;
    }
    let degree = usize::try_from(spline.degree).unwrap_or(1).clamp(1, count - 1);
    let knots = if spline.knot_values.len() == count + degree + 1 {
        spline.knot_values.clone()
    } else {
        clamped_uniform_knots(count, degree)
    };
    let weights: Vec<f64> = if spline.weights.len() == count {
        spline.weights.clone()
    } else {
        vec![1.0; count]
    };

    let start = knots[degree];
    let end = knots[count];
    if end - start <= EPSILON {
        return control;
    }
    let samples = (count * 8).clamp(16, MAX_SEGMENTS);
    (0..=samples)
        .map(|index| {
            let u = start + (end - start) * index as f64 / samples as f64;
            de_boor(&control, &weights, &knots, degree, u)
        })
        .collect()
}

fn clamped_uniform_knots(count: usize, degree: usize) -> Vec<f64> {
    let interior = count - degree;
    let mut knots = vec![0.0; degree + 1];
    for index in 1..interior {
        knots.push(index as f64 / interior as f64);
    }
    knots.extend(std::iter::repeat_n(1.0, degree + 1));
    knots
}

/// 有理 de Boor 求值。
fn de_boor(control: &[DVec2], weights: &[f64], knots: &[f64], degree: usize, u: f64) -> DVec2 {
    let count = control.len();
    // 找到 knots[span] <= u < knots[span + 1]，末端取最后一个非空区间
    let mut span = degree;
    while span + 1 < count && knots[span + 1] <= u {
        span += 1;
    }

    let mut points: Vec<(DVec2, f64)> = (0..=degree)
        .map(|j| {
            let index = span - degree + j;
            let weight = weights[index];
            (control[index] * weight, weight)
        })
        .collect();
    for r in 1..=degree {
        for j in (r..=degree).rev() {
            let i = span - degree + j;
            let denominator = knots[i + degree + 1 - r] - knots[i];
            let alpha = if denominator.abs() < EPSILON {
                0.0
            } else {
                (u - knots[i]) / denominator
            };
            let (previous, previous_weight) = points[j - 1];
            let (current, current_weight) = points[j];
            points[j] = (
                previous * (1.0 - alpha) + current * alpha,
                previous_weight * (1.0 - alpha) + current_weight * alpha,
            );
        }
    }
    let (point, weight) = points[degree];
    if weight.abs() < EPSILON { point } else { point / weight }
}

fn hatch_geometry(hatch: &Hatch, tolerance: f64) -> Option<Geometry<f64>> {
    let mut rings = hatch
        .loops
        .iter()
        .map(|boundary| loop_points(boundary, tolerance))
        .filter(|points| points.len() >= 3)
        .map(|points| ring(&points));
    let exterior = rings.next()?;
    let interiors: Vec<LineString<f64>> = rings.collect();
    Some(Geometry::Polygon(Polygon::new(exterior, interiors)))
}

fn loop_points(boundary: &HatchLoop, tolerance: f64) -> Vec<DVec2> {
    let mut points: Vec<DVec2> = Vec::new();
    for edge in &boundary.edges {
        match edge {
            HatchEdge::Line { start, end } => {
                points.push(start.as_vec2());
                points.push(end.as_vec2());
            }
            HatchEdge::PolylineSegment { start, end, bulge } => {
                points.push(start.as_vec2());
                points.extend(bulge_points(start.as_vec2(), end.as_vec2(), *bulge, tolerance));
            }
            HatchEdge::Arc {
                center,
                radius,
                start_angle,
                end_angle,
                is_counter_clockwise,
            } => {
                let (start, sweep) = if *is_counter_clockwise {
                    (*start_angle, ccw_sweep(*start_angle, *end_angle))
                } else {
                    (-*start_angle, -ccw_sweep(*start_angle, *end_angle))
                };
                points.extend(arc_points(center.as_vec2(), *radius, start, sweep, tolerance));
            }
            HatchEdge::Ellipse {
                center,
                major_axis,
                minor_ratio,
                start_angle,
                end_angle,
                is_counter_clockwise,
            } => {
                let (start, sweep) = if *is_counter_clockwise {
                    (*start_angle, ccw_sweep(*start_angle, *end_angle))
                } else {
                    (-*start_angle, -ccw_sweep(*start_angle, *end_angle))
                };
                points.extend(ellipse_points(
                    center.as_vec2(),
                    major_axis.as_vec2(),
                    *minor_ratio,
                    start,
                    sweep,
                    tolerance,
                ));
            }
        }
    }
    let mut points = dedup(points);
    if points.len() > 1 && points[0].abs_diff_eq(points[points.len() - 1], EPSILON) {
        points.pop();
    }
    points
}

/// 面几何是否可用：环闭合、至少三个不同的点、面积非零、没有自相交或环间交叉。
pub fn is_valid_polygon(polygon: &Polygon<f64>) -> bool {
    let rings: Vec<&LineString<f64>> = std::iter::once(polygon.exterior())
        .chain(polygon.interiors())
        .collect();
    for ring in &rings {
        if !ring_is_simple(ring) {
            return false;
        }
    }
    for (index, first) in rings.iter().enumerate() {
        for second in &rings[index + 1..] {
            if rings_cross(first, second) {
                return false;
            }
        }
    }
    true
}

fn ring_is_simple(ring: &LineString<f64>) -> bool {
    let coords = &ring.0;
    if coords.len() < 4 || coords.first() != coords.last() {
        return false;
    }
    if coords.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
        return false;
    }
    if Polygon::new(ring.clone(), Vec::new()).signed_area().abs() <= EPSILON {
        return false;
    }

    let segments: Vec<Line<f64>> = ring.lines().collect();
    let count = segments.len();
    for i in 0..count {
        for j in (i + 1)..count {
            let adjacent = j == i + 1 || (i == 0 && j == count - 1);
            match line_intersection(segments[i], segments[j]) {
                None => {}
                Some(LineIntersection::SinglePoint { .. }) if adjacent => {}
                Some(_) => return false,
            }
        }
    }
    true
}

fn rings_cross(first: &LineString<f64>, second: &LineString<f64>) -> bool {
    first.lines().any(|a| {
        second.lines().any(|b| match line_intersection(a, b) {
            None => false,
            Some(LineIntersection::SinglePoint { is_proper, .. }) => is_proper,
            Some(LineIntersection::Collinear { .. }) => true,
        })
    })
}

/// 对几何中的每个坐标应用可能失败的转换。`Rect` 与 `Triangle` 转为多边形。
pub fn try_map_geometry<E>(
    geometry: &Geometry<f64>,
    map: &impl Fn(Coord<f64>) -> Result<Coord<f64>, E>,
) -> Result<Geometry<f64>, E> {
    let map_line_string = |line: &LineString<f64>| -> Result<LineString<f64>, E> {
        line.0
            .iter()
            .map(|c| map(*c))
            .collect::<Result<Vec<_>, E>>()
            .map(LineString::new)
    };
    let map_polygon = |polygon: &Polygon<f64>| -> Result<Polygon<f64>, E> {
        let exterior = map_line_string(polygon.exterior())?;
        let interiors = polygon
            .interiors()
            .iter()
            .map(map_line_string)
            .collect::<Result<Vec<_>, E>>()?;
        Ok(Polygon::new(exterior, interiors))
    };

    Ok(match geometry {
        Geometry::Point(point) => Geometry::Point(Point::from(map(point.0)?)),
        Geometry::Line(line) => Geometry::Line(Line::new(map(line.start)?, map(line.end)?)),
        Geometry::LineString(line) => Geometry::LineString(map_line_string(line)?),
        Geometry::Polygon(polygon) => Geometry::Polygon(map_polygon(polygon)?),
        Geometry::MultiPoint(points) => Geometry::MultiPoint(MultiPoint::new(
            points
                .iter()
                .map(|point| map(point.0).map(Point::from))
                .collect::<Result<Vec<_>, E>>()?,
        )),
        Geometry::MultiLineString(lines) => Geometry::MultiLineString(MultiLineString::new(
            lines
                .iter()
                .map(map_line_string)
                .collect::<Result<Vec<_>, E>>()?,
        )),
        Geometry::MultiPolygon(polygons) => Geometry::MultiPolygon(MultiPolygon::new(
            polygons
                .iter()
                .map(map_polygon)
                .collect::<Result<Vec<_>, E>>()?,
        )),
        Geometry::GeometryCollection(collection) => Geometry::GeometryCollection(
            GeometryCollection::from(
                collection
                    .iter()
                    .map(|inner| try_map_geometry(inner, map))
                    .collect::<Result<Vec<_>, E>>()?,
            ),
        ),
        Geometry::Rect(rect) => Geometry::Polygon(map_polygon(&rect.to_polygon())?),
        Geometry::Triangle(triangle) => Geometry::Polygon(map_polygon(&triangle.to_polygon())?),
    })
}

fn position(coord: &Coord<f64>) -> Value {
    json!([coord.x, coord.y])
}

fn positions(line: &LineString<f64>) -> Value {
    Value::Array(line.0.iter().map(position).collect())
}

fn polygon_positions(polygon: &Polygon<f64>) -> Value {
    let mut rings = vec![positions(polygon.exterior())];
    rings.extend(polygon.interiors().iter().map(positions));
    Value::Array(rings)
}

pub fn geometry_to_geojson(geometry: &Geometry<f64>) -> Value {
    match geometry {
        Geometry::Point(point) => json!({"type": "Point", "coordinates": position(&point.0)}),
        Geometry::Line(line) => json!({
            "type": "LineString",
            "coordinates": [position(&line.start), position(&line.end)],
        }),
        Geometry::LineString(line) => json!({"type": "LineString", "coordinates": positions(line)}),
        Geometry::Polygon(polygon) => {
            json!({"type": "Polygon", "coordinates": polygon_positions(polygon)})
        }
        Geometry::MultiPoint(points) => json!({
            "type": "MultiPoint",
            "coordinates": points.iter().map(|point| position(&point.0)).collect::<Vec<_>>(),
        }),
        Geometry::MultiLineString(lines) => json!({
            "type": "MultiLineString",
            "coordinates": lines.iter().map(positions).collect::<Vec<_>>(),
        }),
        Geometry::MultiPolygon(polygons) => json!({
            "type": "MultiPolygon",
            "coordinates": polygons.iter().map(polygon_positions).collect::<Vec<_>>(),
        }),
        Geometry::GeometryCollection(collection) => geometry_collection_to_geojson(collection),
        Geometry::Rect(rect) => geometry_to_geojson(&Geometry::Polygon(rect.to_polygon())),
        Geometry::Triangle(triangle) => {
            geometry_to_geojson(&Geometry::Polygon(triangle.to_polygon()))
        }
    }
}

pub fn geometry_collection_to_geojson(collection: &GeometryCollection<f64>) -> Value {
    json!({
        "type": "GeometryCollection",
        "geometries": collection.iter().map(geometry_to_geojson).collect::<Vec<_>>(),
    })
}
