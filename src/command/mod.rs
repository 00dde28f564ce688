use std::{fmt, str::FromStr};

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

mod dispatch;
mod request;

pub use dispatch::*;
pub use request::*;

/// Text sent to put the drone into SDK mode. The drone answers `ok` once it
/// accepts commands.
pub const HANDSHAKE: &str = "command";

const DISTANCE_RANGE: std::ops::RangeInclusive<u32> = 20..=500;
const DEGREES_RANGE: std::ops::RangeInclusive<u32> = 1..=360;
const COORDINATE_RANGE: std::ops::RangeInclusive<i32> = -500..=500;
const GOTO_SPEED: (u32, u32) = (10, 100);
const CURVE_SPEED: (u32, u32) = (10, 60);

/// The drone ignores relative moves whose components are all this close to
/// zero.
const MIN_OFFSET: i32 = 20;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Up,
    Down,
    Left,
    Right,
    Forward,
    Backward,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotateDirection {
    Clockwise,
    CounterClockwise,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlipDirection {
    Left,
    Right,
    Forward,
    Backward,
}

impl FromStr for Axis {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "u" | "up" => Ok(Axis::Up),
            "d" | "down" => Ok(Axis::Down),
            "l" | "left" => Ok(Axis::Left),
            "r" | "right" => Ok(Axis::Right),
            "f" | "forward" => Ok(Axis::Forward),
            "b" | "back" | "backward" => Ok(Axis::Backward),
            _ => bail!("invalid direction"),
        }
    }
}

impl FromStr for RotateDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cw" | "clockwise" => Ok(RotateDirection::Clockwise),
            "ccw" | "counterclockwise" => Ok(RotateDirection::CounterClockwise),
            _ => bail!("invalid rotation direction"),
        }
    }
}

impl FromStr for FlipDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "l" | "left" => Ok(FlipDirection::Left),
            "r" | "right" => Ok(FlipDirection::Right),
            "f" | "forward" => Ok(FlipDirection::Forward),
            "b" | "back" | "backward" => Ok(FlipDirection::Backward),
            _ => bail!("invalid flip direction"),
        }
    }
}

/// A point relative to the drone's current position, in centimeters.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point3 {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Point3 {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Point3 { x, y, z }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        for c in [self.x, self.y, self.z] {
            if !COORDINATE_RANGE.contains(&c) {
                return Err(ValidationError::Coordinate(c));
            }
        }

        Ok(())
    }

    fn is_near_origin(&self) -> bool {
        [self.x, self.y, self.z].iter().all(|c| c.abs() < MIN_OFFSET)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Takeoff,
    Land,
    Emergency,
    Move { axis: Axis, distance: u32 },
    Rotate { direction: RotateDirection, degrees: u32 },
    Flip { direction: FlipDirection },
    GoTo { x: i32, y: i32, z: i32, speed: u32 },
    Curve { p1: Point3, p2: Point3, speed: u32 },
    StreamOn,
    StreamOff,
    SetSpeed { speed: u32 },
}

impl Command {
    /// Checks parameter ranges. Nothing is sent for a command that fails
    /// here.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Command::Move { distance, .. } => {
                if !DISTANCE_RANGE.contains(distance) {
                    return Err(ValidationError::Distance(*distance));
                }
            }
            Command::Rotate { degrees, .. } => {
                if !DEGREES_RANGE.contains(degrees) {
                    return Err(ValidationError::Degrees(*degrees));
                }
            }
            Command::GoTo { x, y, z, speed } => {
                let target = Point3::new(*x, *y, *z);
                target.validate()?;
                check_speed(*speed, GOTO_SPEED)?;
                if target.is_near_origin() {
                    return Err(ValidationError::TooClose);
                }
            }
            Command::Curve { p1, p2, speed } => {
                p1.validate()?;
                p2.validate()?;
                check_speed(*speed, CURVE_SPEED)?;
                if p1 == p2 {
                    return Err(ValidationError::DegenerateCurve);
                }
            }
            Command::SetSpeed { speed } => check_speed(*speed, GOTO_SPEED)?,
            Command::Takeoff
            | Command::Land
            | Command::Emergency
            | Command::Flip { .. }
            | Command::StreamOn
            | Command::StreamOff => {}
        }

        Ok(())
    }

    pub fn is_emergency(&self) -> bool {
        matches!(self, Command::Emergency)
    }
}

fn check_speed(speed: u32, (min, max): (u32, u32)) -> Result<(), ValidationError> {
    if speed < min || speed > max {
        return Err(ValidationError::Speed { speed, min, max });
    }

    Ok(())
}

/// Formats the command as the text the drone expects on the control channel.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Takeoff => write!(f, "takeoff"),
            Command::Land => write!(f, "land"),
            Command::Emergency => write!(f, "emergency"),
            Command::Move { axis, distance } => {
                let verb = match axis {
                    Axis::Up => "up",
                    Axis::Down => "down",
                    Axis::Left => "left",
                    Axis::Right => "right",
                    Axis::Forward => "forward",
                    Axis::Backward => "back",
                };
                write!(f, "{verb} {distance}")
            }
            Command::Rotate { direction, degrees } => match direction {
                RotateDirection::Clockwise => write!(f, "cw {degrees}"),
                RotateDirection::CounterClockwise => write!(f, "ccw {degrees}"),
            },
            Command::Flip { direction } => {
                let d = match direction {
                    FlipDirection::Left => 'l',
                    FlipDirection::Right => 'r',
                    FlipDirection::Forward => 'f',
                    FlipDirection::Backward => 'b',
                };
                write!(f, "flip {d}")
            }
            Command::GoTo { x, y, z, speed } => write!(f, "go {x} {y} {z} {speed}"),
            Command::Curve { p1, p2, speed } => write!(
                f,
                "curve {} {} {} {} {} {} {speed}",
                p1.x, p1.y, p1.z, p2.x, p2.y, p2.z
            ),
            Command::StreamOn => write!(f, "streamon"),
            Command::StreamOff => write!(f, "streamoff"),
            Command::SetSpeed { speed } => write!(f, "speed {speed}"),
        }
    }
}

/// Stick positions for manual flight. Each channel is clamped to -100..=100.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcVector {
    pub left_right: i32,
    pub forward_backward: i32,
    pub up_down: i32,
    pub yaw: i32,
}

impl RcVector {
    pub fn new(left_right: i32, forward_backward: i32, up_down: i32, yaw: i32) -> Self {
        let clamp = |v: i32| v.clamp(-100, 100);

        RcVector {
            left_right: clamp(left_right),
            forward_backward: clamp(forward_backward),
            up_down: clamp(up_down),
            yaw: clamp(yaw),
        }
    }
}

impl fmt::Display for RcVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rc {} {} {} {}",
            self.left_right, self.forward_backward, self.up_down, self.yaw
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_distance_bounds() {
        let at = |distance| Command::Move {
            axis: Axis::Forward,
            distance,
        };

        assert!(at(20).validate().is_ok());
        assert!(at(500).validate().is_ok());
        assert_eq!(at(19).validate(), Err(ValidationError::Distance(19)));
        assert_eq!(at(501).validate(), Err(ValidationError::Distance(501)));
    }

    #[test]
    fn rotate_degree_bounds() {
        let at = |degrees| Command::Rotate {
            direction: RotateDirection::CounterClockwise,
            degrees,
        };

        assert!(at(1).validate().is_ok());
        assert!(at(360).validate().is_ok());
        assert_eq!(at(0).validate(), Err(ValidationError::Degrees(0)));
        assert_eq!(at(361).validate(), Err(ValidationError::Degrees(361)));
    }

    #[test]
    fn goto_rejects_bad_parameters() {
        let go = |x, y, z, speed| Command::GoTo { x, y, z, speed };

        assert!(go(-500, 0, 500, 10).validate().is_ok());
        assert_eq!(
            go(501, 0, 0, 50).validate(),
            Err(ValidationError::Coordinate(501))
        );
        assert_eq!(
            go(100, 0, 0, 9).validate(),
            Err(ValidationError::Speed {
                speed: 9,
                min: 10,
                max: 100
            })
        );
        assert_eq!(go(19, -19, 0, 50).validate(), Err(ValidationError::TooClose));
    }

    #[test]
    fn curve_rejects_identical_points() {
        let p = Point3::new(50, 50, 0);
        let curve = Command::Curve {
            p1: p,
            p2: p,
            speed: 30,
        };
        assert_eq!(curve.validate(), Err(ValidationError::DegenerateCurve));

        let curve = Command::Curve {
            p1: p,
            p2: Point3::new(100, 0, 0),
            speed: 61,
        };
        assert!(matches!(
            curve.validate(),
            Err(ValidationError::Speed { max: 60, .. })
        ));
    }

    #[test]
    fn wire_text() {
        let cases = [
            (Command::Takeoff, "takeoff"),
            (
                Command::Move {
                    axis: Axis::Backward,
                    distance: 120,
                },
                "back 120",
            ),
            (
                Command::Rotate {
                    direction: RotateDirection::Clockwise,
                    degrees: 90,
                },
                "cw 90",
            ),
            (
                Command::Flip {
                    direction: FlipDirection::Forward,
                },
                "flip f",
            ),
            (
                Command::GoTo {
                    x: -30,
                    y: 40,
                    z: 0,
                    speed: 25,
                },
                "go -30 40 0 25",
            ),
            (
                Command::Curve {
                    p1: Point3::new(20, 20, 0),
                    p2: Point3::new(60, 40, 0),
                    speed: 20,
                },
                "curve 20 20 0 60 40 0 20",
            ),
            (Command::SetSpeed { speed: 50 }, "speed 50"),
        ];

        for (command, text) in cases {
            assert_eq!(command.to_string(), text);
        }
    }

    #[test]
    fn directions_parse_from_short_and_long_names() {
        assert_eq!("back".parse::<Axis>().unwrap(), Axis::Backward);
        assert_eq!("u".parse::<Axis>().unwrap(), Axis::Up);
        assert_eq!(
            "ccw".parse::<RotateDirection>().unwrap(),
            RotateDirection::CounterClockwise
        );
        assert_eq!("r".parse::<FlipDirection>().unwrap(), FlipDirection::Right);
        assert!("sideways".parse::<Axis>().is_err());
    }

    #[test]
    fn rc_vector_is_clamped() {
        let rc = RcVector::new(150, -101, 0, 42);
        assert_eq!(rc.to_string(), "rc 100 -100 0 42");
    }
}
