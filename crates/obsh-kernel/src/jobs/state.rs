//! The job state machine.
//!
//! | trigger     | Foreground          | Background       | Paused              |
//! |-------------|---------------------|------------------|---------------------|
//! | Interrupt   | kill → Dead         | unaffected       | unaffected          |
//! | Suspend     | stop → Paused       | continue         | unaffected          |
//! | Background  | → Background        | no-op            | continue → Background |
//! | Foreground  | no-op               | → Foreground     | continue → Foreground |
//! | Exited      | → Dead              | → Dead           | → Dead              |
//!
//! `Dead` is terminal. The background/suspend cell exists because a suspend
//! from the terminal stops every process in the foreground group, including
//! children running in the background; they are continued right away.

use obsh_types::JobState;

/// Something that happens to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The user interrupted (routed to the foreground job only).
    Interrupt,
    /// The user suspended the terminal.
    Suspend,
    /// Explicit "run in background".
    Background,
    /// Explicit "run in foreground".
    Foreground,
    /// The process exited, was killed, or a kill could not be confirmed.
    Exited,
}

/// What must be done to the process for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Run the kill sequence.
    Kill,
    /// Send the suspend signal.
    Stop,
    /// Send the continue signal.
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: JobState,
    pub effect: Effect,
}

impl Transition {
    fn to(next: JobState, effect: Effect) -> Self {
        Self { next, effect }
    }

    fn stay(state: JobState) -> Self {
        Self::to(state, Effect::None)
    }
}

/// The transition table.
pub trait Lifecycle {
    fn apply(self, trigger: Trigger) -> Transition;
}

impl Lifecycle for JobState {
    fn apply(self, trigger: Trigger) -> Transition {
        use JobState::*;

        match (self, trigger) {
            (Dead, _) => Transition::stay(Dead),
            (_, Trigger::Exited) => Transition::to(Dead, Effect::None),

            (Foreground, Trigger::Interrupt) => Transition::to(Dead, Effect::Kill),
            (Foreground, Trigger::Suspend) => Transition::to(Paused, Effect::Stop),
            (Foreground, Trigger::Background) => Transition::stay(Background),
            (Foreground, Trigger::Foreground) => Transition::stay(Foreground),

            (Background, Trigger::Interrupt) => Transition::stay(Background),
            (Background, Trigger::Suspend) => Transition::to(Background, Effect::Continue),
            (Background, Trigger::Background) => Transition::stay(Background),
            (Background, Trigger::Foreground) => Transition::stay(Foreground),

            (Paused, Trigger::Interrupt) => Transition::stay(Paused),
            (Paused, Trigger::Suspend) => Transition::stay(Paused),
            (Paused, Trigger::Background) => Transition::to(Background, Effect::Continue),
            (Paused, Trigger::Foreground) => Transition::to(Foreground, Effect::Continue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obsh_types::JobState::*;
    use rstest::rstest;

    #[rstest]
    #[case(Foreground, Trigger::Interrupt, Dead, Effect::Kill)]
    #[case(Foreground, Trigger::Suspend, Paused, Effect::Stop)]
    #[case(Foreground, Trigger::Background, Background, Effect::None)]
    #[case(Foreground, Trigger::Foreground, Foreground, Effect::None)]
    #[case(Foreground, Trigger::Exited, Dead, Effect::None)]
    #[case(Background, Trigger::Interrupt, Background, Effect::None)]
    #[case(Background, Trigger::Suspend, Background, Effect::Continue)]
    #[case(Background, Trigger::Background, Background, Effect::None)]
    #[case(Background, Trigger::Foreground, Foreground, Effect::None)]
    #[case(Background, Trigger::Exited, Dead, Effect::None)]
    #[case(Paused, Trigger::Interrupt, Paused, Effect::None)]
    #[case(Paused, Trigger::Suspend, Paused, Effect::None)]
    #[case(Paused, Trigger::Background, Background, Effect::Continue)]
    #[case(Paused, Trigger::Foreground, Foreground, Effect::Continue)]
    #[case(Paused, Trigger::Exited, Dead, Effect::None)]
    #[case(Dead, Trigger::Foreground, Dead, Effect::None)]
    #[case(Dead, Trigger::Interrupt, Dead, Effect::None)]
    fn test_transition_table(
        #[case] from: JobState,
        #[case] trigger: Trigger,
        #[case] next: JobState,
        #[case] effect: Effect,
    ) {
        assert_eq!(from.apply(trigger), Transition { next, effect });
    }
}
