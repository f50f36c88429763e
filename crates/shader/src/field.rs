//! A reference energy/matter rule for the field driver.
//!
//! Channel 0 of a cell is energy, channel 1 is matter. Energy grows or decays depending on how
//! closely the ring-weighted energy around it matches `mu`. Matter slowly accumulates where energy
//! lingers and, in turn, damps how fast energy can change. The globally reduced mean energy is fed
//! back as `average`, nudging growth down when the field runs hotter than `target_mean`.

use glam::Vec4;

/// The width of the ring that weights the neighbourhood. The ring peaks half way out to the
/// radius.
const RING_WIDTH: f32 = 0.15;

/// Where the ring peaks, as a fraction of the radius.
const RING_PEAK: f32 = 0.5;

/// Parameters of the rule.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rule {
    /// Neighbourhood radius in cells.
    pub radius: u32,
    /// The neighbourhood potential at which growth peaks.
    pub mu: f32,
    /// How tolerant growth is of potentials away from `mu`.
    pub sigma: f32,
    /// Time step.
    pub dt: f32,
    /// Fraction of matter lost every step.
    pub decay: f32,
    /// The mean energy the feedback term steers towards.
    pub target_mean: f32,
    /// Strength of the feedback term.
    pub feedback: f32,
}

impl Default for Rule {
    fn default() -> Self {
        Self {
            radius: 8,
            mu: 0.15,
            sigma: 0.017,
            dt: 0.1,
            decay: 0.01,
            target_mean: 0.12,
            feedback: 0.5,
        }
    }
}

/// Names of the rule's uniforms, in the order the WGSL reads them.
pub const UNIFORMS: [&str; 8] = [
    "radius",
    "mu",
    "sigma",
    "dt",
    "decay",
    "target_mean",
    "feedback",
    "average",
];

impl Rule {
    /// Uniform values matching [`UNIFORMS`], with the global mean set to `average`.
    #[must_use]
    pub fn uniforms(&self, average: f32) -> [(&'static str, f32); 8] {
        #[expect(
            clippy::as_conversions,
            clippy::cast_precision_loss,
            reason = "Radii are small enough to be exact in an `f32`"
        )]
        let radius = self.radius as f32;
        [
            ("radius", radius),
            ("mu", self.mu),
            ("sigma", self.sigma),
            ("dt", self.dt),
            ("decay", self.decay),
            ("target_mean", self.target_mean),
            ("feedback", self.feedback),
            ("average", average),
        ]
    }

    /// How much a cell's energy should change, before the time step is applied.
    #[must_use]
    pub fn growth(&self, potential: f32, average: f32) -> f32 {
        2.0f32.mul_add(bell(potential, self.mu, self.sigma), -1.0)
            - self.feedback * (average - self.target_mean)
    }

    /// The next state of a cell given its neighbourhood potential.
    #[must_use]
    pub fn next(&self, current: Vec4, potential: f32, average: f32) -> Vec4 {
        let growth = self.growth(potential, average);
        let energy = (self.dt * growth)
            .mul_add(0.5f32.mul_add(-current.y, 1.0), current.x)
            .clamp(0.0, 1.0);
        let matter = self
            .dt
            .mul_add(energy.mul_add(0.5, -(self.decay * current.y)), current.y)
            .clamp(0.0, 1.0);
        Vec4::new(energy, matter, 0.0, 0.0)
    }
}

/// A gaussian bump of height 1 centred on `mean`.
#[must_use]
#[inline]
pub fn bell(value: f32, mean: f32, width: f32) -> f32 {
    let distance = (value - mean) / width;
    (-0.5 * distance * distance).exp()
}

/// The ring-shaped neighbourhood of a cell as weighted offsets. The weights sum to 1.
#[derive(Clone, Debug, Default)]
pub struct Neighbourhood {
    /// `(dx, dy, weight)` for every cell within the radius, excluding the centre.
    offsets: Vec<(i32, i32, f32)>,
}

impl Neighbourhood {
    /// Weigh every offset within `radius` of the centre.
    #[must_use]
    pub fn new(radius: u32) -> Self {
        let Ok(reach) = i32::try_from(radius) else {
            return Self::default();
        };
        #[expect(
            clippy::as_conversions,
            clippy::cast_precision_loss,
            reason = "Radii are small enough to be exact in an `f32`"
        )]
        let scale = radius.max(1) as f32;

        let mut offsets = Vec::new();
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                #[expect(
                    clippy::as_conversions,
                    clippy::cast_precision_loss,
                    reason = "Offsets are small enough to be exact in an `f32`"
                )]
                let distance = ((dx * dx + dy * dy) as f32).sqrt() / scale;
                if distance > 0.0 && distance <= 1.0 {
                    offsets.push((dx, dy, bell(distance, RING_PEAK, RING_WIDTH)));
                }
            }
        }

        let total: f32 = offsets.iter().map(|&(_, _, weight)| weight).sum();
        if total > 0.0 {
            for offset in &mut offsets {
                offset.2 /= total;
            }
        }
        Self { offsets }
    }

    /// The weighted sum of `sample` over the neighbourhood.
    #[must_use]
    pub fn potential(&self, sample: impl Fn(i32, i32) -> f32) -> f32 {
        self.offsets
            .iter()
            .map(|&(dx, dy, weight)| weight * sample(dx, dy))
            .sum()
    }

    /// How many cells take part.
    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Whether the neighbourhood is empty, as it is for a radius of 0.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

/// The WGSL twin of [`Rule::next`] over a [`Neighbourhood`]. Written for a self-dependent
/// variable called `field`, with the uniforms named in [`UNIFORMS`].
pub const FIELD_WGSL: &str = r"
fn bell(value: f32, mean: f32, width: f32) -> f32 {
    let distance = (value - mean) / width;
    return exp(-0.5 * distance * distance);
}

fn cell(position: vec2<i32>) -> vec4<f32> {
    let reach = i32(uniforms.radius);
    let scale = max(uniforms.radius, 1.0);
    var total: f32 = 0.0;
    var weights: f32 = 0.0;
    for (var dy: i32 = -reach; dy <= reach; dy = dy + 1) {
        for (var dx: i32 = -reach; dx <= reach; dx = dx + 1) {
            let distance = length(vec2<f32>(f32(dx), f32(dy))) / scale;
            if (distance > 0.0 && distance <= 1.0) {
                let weight = bell(distance, 0.5, 0.15);
                total = total + weight * sample_field(position.x + dx, position.y + dy).x;
                weights = weights + weight;
            }
        }
    }
    var potential: f32 = 0.0;
    if (weights > 0.0) {
        potential = total / weights;
    }

    let current = sample_field(position.x, position.y);
    let growth = 2.0 * bell(potential, uniforms.mu, uniforms.sigma) - 1.0
        - uniforms.feedback * (uniforms.average - uniforms.target_mean);
    let energy = clamp(current.x + uniforms.dt * growth * (1.0 - 0.5 * current.y), 0.0, 1.0);
    let matter = clamp(
        current.y + uniforms.dt * (energy * 0.5 - uniforms.decay * current.y),
        0.0,
        1.0,
    );
    return vec4<f32>(energy, matter, 0.0, 0.0);
}
";

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn weights_are_normalised() {
        let neighbourhood = Neighbourhood::new(5);
        let total = neighbourhood.potential(|_, _| 1.0);
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn zero_radius_has_no_neighbours() {
        let neighbourhood = Neighbourhood::new(0);
        assert!(neighbourhood.is_empty());
        assert!(neighbourhood.potential(|_, _| 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn neighbourhood_excludes_the_centre() {
        let neighbourhood = Neighbourhood::new(1);
        assert_eq!(neighbourhood.len(), 4);
        let potential = neighbourhood.potential(|dx, dy| if dx == 0 && dy == 0 { 100.0 } else { 0.0 });
        assert!(potential.abs() < f32::EPSILON);
    }

    #[test]
    fn growth_peaks_at_mu() {
        let rule = Rule::default();
        let at_peak = rule.growth(rule.mu, rule.target_mean);
        assert!((at_peak - 1.0).abs() < 1e-6);
        assert!(rule.growth(0.9, rule.target_mean) < -0.99);
    }

    #[test]
    fn feedback_damps_an_overheated_field() {
        let rule = Rule::default();
        let calm = rule.growth(rule.mu, rule.target_mean);
        let hot = rule.growth(rule.mu, rule.target_mean + 0.4);
        assert!(hot < calm);
    }

    #[test]
    fn next_stays_in_range() {
        let rule = Rule {
            dt: 10.0,
            ..Rule::default()
        };
        let grown = rule.next(Vec4::new(0.9, 0.0, 0.0, 0.0), rule.mu, rule.target_mean);
        assert!((grown.x - 1.0).abs() < f32::EPSILON);
        let starved = rule.next(Vec4::new(0.1, 0.0, 0.0, 0.0), 1.0, rule.target_mean);
        assert!(starved.x.abs() < f32::EPSILON);
        assert!(grown.z.abs() < f32::EPSILON && grown.w.abs() < f32::EPSILON);
    }

    #[test]
    fn uniforms_follow_declaration_order() {
        let names: Vec<&str> = Rule::default()
            .uniforms(0.0)
            .iter()
            .map(|&(name, _)| name)
            .collect();
        assert_eq!(names, UNIFORMS);
    }
}
