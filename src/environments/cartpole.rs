use crate::environment::{Environment, StepResult};
use rand::random_range;

const GRAVITY: f32 = 9.8; // 重力加速度
const CART_MASS: f32 = 1.0; // 小车质量
const POLE_MASS: f32 = 0.1; // 杆质量
const POLE_HALF_LENGTH: f32 = 0.5;
const FORCE: f32 = 10.0;
const DT: f32 = 0.02; // 时间步长
const X_LIMIT: f32 = 2.4;
const THETA_LIMIT_DEG: f32 = 12.0;

/// Classic cart-pole balancing task, state `[x, x_dot, theta, theta_dot]`.
///
/// Reward is 1 for every step taken; the episode ends when the pole falls,
/// the cart leaves the track or `step_limit` steps have elapsed.
pub struct CartPole {
    pub state: [f32; 4],
    pub step_limit: usize,
    pub step_count: usize,
}

impl Default for CartPole {
    fn default() -> Self {
        Self::new()
    }
}

impl CartPole {
    pub fn new() -> Self {
        Self::with_step_limit(200)
    }

    pub fn with_step_limit(step_limit: usize) -> Self {
        Self {
            state: [0.0; 4],
            step_limit,
            step_count: 0,
        }
    }

    fn out_of_bounds(state: &[f32; 4]) -> bool {
        state[0].abs() > X_LIMIT || state[2].abs() > THETA_LIMIT_DEG.to_radians()
    }

    fn dynamics(state: [f32; 4], action: i64) -> [f32; 4] {
        let [x, x_dot, theta, theta_dot] = state;
        let force = if action == 1 { FORCE } else { -FORCE };
        let total_mass = CART_MASS + POLE_MASS;

        let costheta = theta.cos();
        let sintheta = theta.sin();
        let temp = (force + POLE_MASS * POLE_HALF_LENGTH * theta_dot.powi(2) * sintheta) / total_mass;
        let theta_acc = (GRAVITY * sintheta - costheta * temp)
            / (POLE_HALF_LENGTH * (4.0 / 3.0 - POLE_MASS * costheta.powi(2) / total_mass));
        let x_acc = temp - POLE_MASS * POLE_HALF_LENGTH * theta_acc * costheta / total_mass;

        [
            x + DT * x_dot,
            x_dot + DT * x_acc,
            theta + DT * theta_dot,
            theta_dot + DT * theta_acc,
        ]
    }
}

impl Environment for CartPole {
    type State = [f32; 4];
    type Action = i64; // 0: left, 1: right
    type Reward = f32;

    fn reset(&mut self) -> Self::State {
        self.state = [
            random_range(-0.05..0.05),
            random_range(-0.05..0.05),
            random_range(-0.05..0.05),
            random_range(-0.05..0.05),
        ];
        self.step_count = 0;
        self.state
    }

    fn step(&mut self, action: &Self::Action) -> StepResult<Self::State, Self::Reward> {
        self.state = Self::dynamics(self.state, *action);
        self.step_count += 1;
        StepResult {
            next_state: self.state,
            reward: 1.0,
            done: Self::out_of_bounds(&self.state) || self.step_count >= self.step_limit,
        }
    }

    fn current_state(&self) -> Self::State {
        self.state
    }

    fn action_space(&self) -> usize {
        2 // 0: left, 1: right
    }

    fn state_dim(&self) -> usize {
        4 // [x, x_dot, theta, theta_dot]
    }
}
