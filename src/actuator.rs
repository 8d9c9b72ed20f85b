/// 分拣执行器 (Sorting actuator)
///
/// 类别 → 分拣格: paper 1, plastic 2, metal 3, cardboard 不动作, 其余 4。
/// 每格对应步进电机的行程; 引脚级驱动不在本 crate 内, 由 MotionDriver 实现。
use std::fmt;

pub trait Actuator: Send {
    fn actuate(&mut self, category: &str);
}

/// 不做任何动作
#[derive(Debug, Default)]
pub struct NullActuator;

impl Actuator for NullActuator {
    fn actuate(&mut self, _category: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compartment {
    Paper = 1,
    Plastic = 2,
    Metal = 3,
    Rubbish = 4,
}

impl Compartment {
    /// cardboard 返回 None
    pub fn for_category(category: &str) -> Option<Self> {
        match category.trim().to_ascii_lowercase().as_str() {
            "paper" => Some(Compartment::Paper),
            "plastic" => Some(Compartment::Plastic),
            "metal" => Some(Compartment::Metal),
            "cardboard" => None,
            _ => Some(Compartment::Rubbish),
        }
    }

    /// 滑台从中位到该格的行程 (cm)
    pub fn travel_cm(&self) -> f32 {
        match self {
            Compartment::Paper => -16.0,
            Compartment::Plastic => -6.5,
            Compartment::Metal => 6.0,
            Compartment::Rubbish => 17.0,
        }
    }

    pub fn index(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for Compartment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compartment {}", self.index())
    }
}

/// 单步动作
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Motion {
    Stepper { cm: f32 },
    Servo { degrees: f32 },
    Settle { ms: u64 },
}

/// 投放一件物品的完整动作序列: 移到格位, 翻板, 回位
pub fn sort_sequence(compartment: Compartment) -> Vec<Motion> {
    let travel = compartment.travel_cm();
    vec![
        Motion::Stepper { cm: travel },
        Motion::Servo { degrees: 60.0 },
        Motion::Settle { ms: 1000 },
        Motion::Servo { degrees: 90.0 },
        Motion::Settle { ms: 500 },
        Motion::Stepper { cm: -travel },
        Motion::Settle { ms: 1000 },
    ]
}

/// 执行动作的硬件驱动
pub trait MotionDriver: Send {
    fn execute(&mut self, motion: Motion);
}

/// 只记录日志的驱动
#[derive(Debug, Default)]
pub struct LoggingDriver;

impl MotionDriver for LoggingDriver {
    fn execute(&mut self, motion: Motion) {
        tracing::debug!(?motion, "motion");
    }
}

pub struct SortingActuator<D: MotionDriver = LoggingDriver> {
    driver: D,
    sorted: u64,
}

impl SortingActuator<LoggingDriver> {
    pub fn logging() -> Self {
        Self::new(LoggingDriver)
    }
}

impl<D: MotionDriver> SortingActuator<D> {
    pub fn new(driver: D) -> Self {
        Self { driver, sorted: 0 }
    }

    pub fn sorted(&self) -> u64 {
        self.sorted
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }
}

impl<D: MotionDriver> Actuator for SortingActuator<D> {
    fn actuate(&mut self, category: &str) {
        let Some(compartment) = Compartment::for_category(category) else {
            tracing::info!(category, "no compartment, item stays");
            return;
        };
        tracing::info!(category, %compartment, travel_cm = compartment.travel_cm(), "sorting");
        for motion in sort_sequence(compartment) {
            self.driver.execute(motion);
        }
        self.sorted += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Vec<Motion>);

    impl MotionDriver for Recorder {
        fn execute(&mut self, motion: Motion) {
            self.0.push(motion);
        }
    }

    #[test]
    fn test_category_mapping() {
        assert_eq!(Compartment::for_category("paper"), Some(Compartment::Paper));
        assert_eq!(Compartment::for_category("Plastic"), Some(Compartment::Plastic));
        assert_eq!(Compartment::for_category("metal"), Some(Compartment::Metal));
        assert_eq!(Compartment::for_category("cardboard"), None);
        assert_eq!(Compartment::for_category("glass"), Some(Compartment::Rubbish));
        assert_eq!(Compartment::for_category("rubbish"), Some(Compartment::Rubbish));
    }

    #[test]
    fn test_sequence_returns_to_center() {
        let moves = sort_sequence(Compartment::Plastic);
        let net: f32 = moves
            .iter()
            .filter_map(|m| match m {
                Motion::Stepper { cm } => Some(*cm),
                _ => None,
            })
            .sum();
        assert_eq!(net, 0.0);
        assert_eq!(moves[0], Motion::Stepper { cm: -6.5 });
    }

    #[test]
    fn test_actuator_drives_motions() {
        let mut actuator = SortingActuator::new(Recorder::default());
        actuator.actuate("metal");
        actuator.actuate("cardboard");
        assert_eq!(actuator.sorted(), 1);
        assert_eq!(actuator.driver().0.len(), sort_sequence(Compartment::Metal).len());
    }
}
