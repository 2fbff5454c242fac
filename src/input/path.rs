//! Curved pointer trajectories.

use rand::Rng;

use super::timing::uniform;
use crate::capture::Point;

/// Distance at which the step count reaches its maximum.
const FULL_STEPS_DISTANCE: f64 = 500.0;

/// Number of segments for a move of `distance` pixels.
pub fn step_count(distance: f64, steps_min: u32, steps_max: u32) -> u32 {
    let span = f64::from(steps_max.saturating_sub(steps_min));
    let steps = f64::from(steps_min) + span * (distance / FULL_STEPS_DISTANCE).min(1.0);
    (steps as u32).max(1)
}

fn cubic(t: f64, p0: f64, p1: f64, p2: f64, p3: f64) -> f64 {
    let u = 1.0 - t;
    u * u * u * p0 + 3.0 * u * u * t * p1 + 3.0 * u * t * t * p2 + t * t * t * p3
}

/// Cubic Bézier from `start` to `end` with `steps + 1` rounded points.
///
/// The control points sit at 30% and 70% of the straight line, each
/// displaced uniformly by up to `curve_variance × distance` on both axes.
pub fn bezier_path<R: Rng + ?Sized>(
    rng: &mut R,
    start: Point,
    end: Point,
    steps: u32,
    curve_variance: f64,
) -> Vec<Point> {
    let steps = steps.max(1);
    let (sx, sy) = (f64::from(start.x), f64::from(start.y));
    let (dx, dy) = (f64::from(end.x) - sx, f64::from(end.y) - sy);
    let variance = (dx * dx + dy * dy).sqrt() * curve_variance.abs();

    let mut jitter = || uniform(&mut *rng, -variance, variance);
    let c1 = (sx + dx * 0.3 + jitter(), sy + dy * 0.3 + jitter());
    let c2 = (sx + dx * 0.7 + jitter(), sy + dy * 0.7 + jitter());
    let (ex, ey) = (f64::from(end.x), f64::from(end.y));

    (0..=steps)
        .map(|i| {
            let t = f64::from(i) / f64::from(steps);
            Point::new(
                cubic(t, sx, c1.0, c2.0, ex).round() as i32,
                cubic(t, sy, c1.1, c2.1, ey).round() as i32,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_step_count_scales_with_distance() {
        assert_eq!(step_count(0.0, 20, 40), 20);
        assert_eq!(step_count(250.0, 20, 40), 30);
        assert_eq!(step_count(5000.0, 20, 40), 40);
        assert_eq!(step_count(100.0, 0, 0), 1, "never zero segments");
    }

    #[test]
    fn test_path_endpoints() {
        let mut rng = StdRng::seed_from_u64(4);
        let path = bezier_path(&mut rng, Point::new(10, 20), Point::new(400, 300), 30, 0.3);
        assert_eq!(path.len(), 31);
        assert_eq!(path[0], Point::new(10, 20));
        assert_eq!(path[30], Point::new(400, 300));
    }

    #[test]
    fn test_zero_distance_path_is_minimal() {
        let mut rng = StdRng::seed_from_u64(5);
        let here = Point::new(640, 360);
        let steps = step_count(0.0, 20, 40);
        let path = bezier_path(&mut rng, here, here, steps, 0.3);
        assert_eq!(path.len(), 21);
        assert!(path.iter().all(|p| *p == here), "no wandering for a zero-length move");
    }

    #[test]
    fn test_path_is_curved() {
        let mut rng = StdRng::seed_from_u64(6);
        let path = bezier_path(&mut rng, Point::new(0, 0), Point::new(1000, 0), 40, 0.3);
        assert!(path.iter().any(|p| p.y != 0), "control point jitter bends the path");
    }
}
