use crate::vr::runtime::{
    ActionHandle, ActionSetHandle, ActionStateBoolean, ActionType, PathHandle, SpaceHandle,
    SuggestedBinding, XrRuntime,
};
use crate::vr::{Posef, SpaceLocation, Time, Vector2f, XrResult, XrResultExt};
use thiserror::Error;

pub const ACTION_SET_NAME: &str = "vrtemplate_controls";
pub const ACTION_SET_LOCALIZED_NAME: &str = "VR Template Controls";
pub const ACTION_SET_PRIORITY: u32 = 1;

pub const LEFT_HAND_PATH: &str = "/user/hand/left";
pub const RIGHT_HAND_PATH: &str = "/user/hand/right";
pub const TOUCH_CONTROLLER_PROFILE: &str = "/interaction_profiles/oculus/touch_controller";

/// Upper bound on suggested bindings for one interaction profile.
pub const MAX_BINDINGS: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("binding table full ({capacity} entries), cannot add {path}")]
    BindingOverflow { capacity: usize, path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Hand {
    Left,
    #[default]
    Right,
}

impl Hand {
    pub const BOTH: [Hand; 2] = [Hand::Left, Hand::Right];

    pub fn index(self) -> usize {
        match self {
            Hand::Left => 0,
            Hand::Right => 1,
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            Hand::Left => LEFT_HAND_PATH,
            Hand::Right => RIGHT_HAND_PATH,
        }
    }
}

/// Fixed-capacity list of suggested bindings. Overflow is reported instead of truncated.
#[derive(Debug, Default)]
pub struct BindingTable {
    entries: Vec<SuggestedBinding>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(MAX_BINDINGS),
        }
    }

    pub fn add(
        &mut self,
        runtime: &mut dyn XrRuntime,
        action: ActionHandle,
        path: &str,
    ) -> XrResult<()> {
        if self.entries.len() >= MAX_BINDINGS {
            return Err(InputError::BindingOverflow {
                capacity: MAX_BINDINGS,
                path: path.to_string(),
            }
            .into());
        }
        let path = runtime.string_to_path(path)?;
        self.entries.push(SuggestedBinding { action, path });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn as_slice(&self) -> &[SuggestedBinding] {
        &self.entries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputActions {
    pub a_button: ActionHandle,
    pub b_button: ActionHandle,
    pub x_button: ActionHandle,
    pub y_button: ActionHandle,
    pub menu: ActionHandle,
    pub hand_pose: ActionHandle,
    pub trigger: ActionHandle,
    pub squeeze: ActionHandle,
    pub thumbstick: ActionHandle,
    pub thumbstick_click: ActionHandle,
    pub thumbrest_touch: ActionHandle,
}

/// Action set, actions and hand spaces, declared once per session.
#[derive(Debug)]
pub struct InputStateStatic {
    action_set: Option<ActionSetHandle>,
    actions: InputActions,
    hand_paths: [PathHandle; 2],
    hand_spaces: [Option<SpaceHandle>; 2],
}

impl InputStateStatic {
    /// Declares the action set, suggests touch-controller bindings and attaches the set to the
    /// session. A rejected binding suggestion only disables that profile.
    pub fn create(runtime: &mut dyn XrRuntime) -> XrResult<Self> {
        let set = runtime
            .create_action_set(
                ACTION_SET_NAME,
                ACTION_SET_LOCALIZED_NAME,
                ACTION_SET_PRIORITY,
            )
            .logged()?;
        let hand_paths = [
            runtime.string_to_path(LEFT_HAND_PATH).logged()?,
            runtime.string_to_path(RIGHT_HAND_PATH).logged()?,
        ];

        let mut declare = |name: &str, localized: &str, ty: ActionType, per_hand: bool| {
            let subaction_paths: &[PathHandle] = if per_hand { &hand_paths } else { &[] };
            runtime
                .create_action(set, name, localized, ty, subaction_paths)
                .logged()
        };
        let actions = InputActions {
            a_button: declare("a_button", "A Button", ActionType::Boolean, false)?,
            b_button: declare("b_button", "B Button", ActionType::Boolean, false)?,
            x_button: declare("x_button", "X Button", ActionType::Boolean, false)?,
            y_button: declare("y_button", "Y Button", ActionType::Boolean, false)?,
            menu: declare("menu", "Menu Button", ActionType::Boolean, false)?,
            hand_pose: declare("hand_pose", "Hand Pose", ActionType::Pose, true)?,
            trigger: declare("trigger", "Trigger", ActionType::Boolean, true)?,
            squeeze: declare("squeeze", "Grip", ActionType::Boolean, true)?,
            thumbstick: declare("thumbstick", "Thumbstick", ActionType::Vector2f, true)?,
            thumbstick_click: declare(
                "thumbstick_click",
                "Thumbstick Click",
                ActionType::Boolean,
                true,
            )?,
            thumbrest_touch: declare(
                "thumbrest_touch",
                "Thumbrest Touch",
                ActionType::Boolean,
                true,
            )?,
        };

        let mut input = Self {
            action_set: Some(set),
            actions,
            hand_paths,
            hand_spaces: [None, None],
        };

        if let Err(err) = input.suggest_touch_bindings(runtime) {
            log::warn!("[input] touch controller bindings rejected: {err}");
        }
        if let Err(err) = runtime.attach_action_sets(&[set]).logged() {
            input.destroy(runtime);
            return Err(err);
        }
        log::debug!("[input] actions and bindings initialized");
        Ok(input)
    }

    fn suggest_touch_bindings(&self, runtime: &mut dyn XrRuntime) -> XrResult<()> {
        let actions = &self.actions;
        let mut table = BindingTable::new();
        table.add(runtime, actions.menu, "/user/hand/left/input/menu/click")?;
        table.add(runtime, actions.hand_pose, "/user/hand/left/input/aim/pose")?;
        table.add(runtime, actions.hand_pose, "/user/hand/right/input/aim/pose")?;
        table.add(runtime, actions.a_button, "/user/hand/right/input/a/click")?;
        table.add(runtime, actions.b_button, "/user/hand/right/input/b/click")?;
        table.add(runtime, actions.x_button, "/user/hand/left/input/x/click")?;
        table.add(runtime, actions.y_button, "/user/hand/left/input/y/click")?;
        for hand in Hand::BOTH {
            let root = hand.path();
            table.add(runtime, actions.trigger, &format!("{root}/input/trigger"))?;
            table.add(runtime, actions.squeeze, &format!("{root}/input/squeeze/value"))?;
            table.add(runtime, actions.thumbstick, &format!("{root}/input/thumbstick"))?;
            table.add(
                runtime,
                actions.thumbstick_click,
                &format!("{root}/input/thumbstick/click"),
            )?;
            table.add(
                runtime,
                actions.thumbrest_touch,
                &format!("{root}/input/thumbrest/touch"),
            )?;
        }

        let profile = runtime.string_to_path(TOUCH_CONTROLLER_PROFILE)?;
        runtime.suggest_bindings(profile, table.as_slice())?;
        log::debug!("[input] suggested {} touch controller bindings", table.len());
        Ok(())
    }

    pub fn action_set(&self) -> Option<ActionSetHandle> {
        self.action_set
    }

    pub fn actions(&self) -> &InputActions {
        &self.actions
    }

    pub fn hand_path(&self, hand: Hand) -> PathHandle {
        self.hand_paths[hand.index()]
    }

    pub fn hand_space(&self, hand: Hand) -> Option<SpaceHandle> {
        self.hand_spaces[hand.index()]
    }

    /// Returns the hand's action space, creating it on first use.
    fn ensure_hand_space(
        &mut self,
        runtime: &mut dyn XrRuntime,
        hand: Hand,
    ) -> XrResult<SpaceHandle> {
        if let Some(space) = self.hand_spaces[hand.index()] {
            return Ok(space);
        }
        let space = runtime
            .create_action_space(self.actions.hand_pose, self.hand_path(hand), Posef::IDENTITY)
            .logged()?;
        log::debug!("[input] created {:?} hand space", hand);
        self.hand_spaces[hand.index()] = Some(space);
        Ok(space)
    }

    /// Destroys hand spaces before the action set they depend on. Idempotent.
    pub fn destroy(&mut self, runtime: &mut dyn XrRuntime) {
        for space in self.hand_spaces.iter_mut().filter_map(Option::take) {
            runtime.destroy_space(space);
        }
        if let Some(set) = self.action_set.take() {
            runtime.destroy_action_set(set);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ButtonState {
    pub current: bool,
    pub changed_since_last_sync: bool,
    pub is_active: bool,
}

impl ButtonState {
    pub fn just_pressed(&self) -> bool {
        self.changed_since_last_sync && self.current
    }
}

impl From<ActionStateBoolean> for ButtonState {
    fn from(state: ActionStateBoolean) -> Self {
        Self {
            current: state.current,
            changed_since_last_sync: state.changed_since_last_sync,
            is_active: state.is_active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AxisState {
    pub current: Vector2f,
    pub changed_since_last_sync: bool,
    pub is_active: bool,
}

/// Input polled this tick. Every field is overwritten by the next sync.
#[derive(Debug, Clone, Default)]
pub struct InputStateFrame {
    pub a_button: ButtonState,
    pub b_button: ButtonState,
    pub x_button: ButtonState,
    pub y_button: ButtonState,
    pub menu: ButtonState,
    pub trigger: [ButtonState; 2],
    pub squeeze: [ButtonState; 2],
    pub thumbstick: [AxisState; 2],
    pub thumbstick_click: [ButtonState; 2],
    pub thumbrest_touch: [ButtonState; 2],
    pub hand_locations: [SpaceLocation; 2],
    pub hand_active: [bool; 2],
    pub preferred_hand: Hand,
}

impl InputStateFrame {
    /// Syncs every action in one runtime call, then reads buttons and thumbsticks.
    pub fn sync_buttons_and_thumbsticks(
        &mut self,
        runtime: &mut dyn XrRuntime,
        input: &InputStateStatic,
    ) -> XrResult<()> {
        let Some(set) = input.action_set() else {
            return Err(crate::vr::XrError::Lifecycle("xrSyncActions"));
        };
        runtime.sync_actions(set).logged()?;

        let actions = input.actions();
        let button = |action: ActionHandle, path: Option<PathHandle>| {
            runtime
                .action_state_boolean(action, path)
                .logged()
                .map(ButtonState::from)
        };
        self.a_button = button(actions.a_button, None)?;
        self.b_button = button(actions.b_button, None)?;
        self.x_button = button(actions.x_button, None)?;
        self.y_button = button(actions.y_button, None)?;
        self.menu = button(actions.menu, None)?;

        for hand in Hand::BOTH {
            let i = hand.index();
            let path = Some(input.hand_path(hand));
            self.trigger[i] = button(actions.trigger, path)?;
            self.squeeze[i] = button(actions.squeeze, path)?;
            self.thumbstick_click[i] = button(actions.thumbstick_click, path)?;
            self.thumbrest_touch[i] = button(actions.thumbrest_touch, path)?;
            let stick = runtime
                .action_state_vector2f(actions.thumbstick, path)
                .logged()?;
            self.thumbstick[i] = AxisState {
                current: stick.current,
                changed_since_last_sync: stick.changed_since_last_sync,
                is_active: stick.is_active,
            };
        }
        Ok(())
    }

    /// Locates each active hand in `base`, creating hand spaces lazily, then updates the
    /// preferred hand. Call after `sync_buttons_and_thumbsticks` for the same tick.
    pub fn sync_hand_poses(
        &mut self,
        runtime: &mut dyn XrRuntime,
        input: &mut InputStateStatic,
        base: SpaceHandle,
        time: Time,
    ) -> XrResult<()> {
        for hand in Hand::BOTH {
            let i = hand.index();
            let pose_active = runtime
                .action_state_pose_active(input.actions().hand_pose, Some(input.hand_path(hand)))
                .logged()?;
            if !pose_active {
                self.hand_active[i] = false;
                continue;
            }
            let space = input.ensure_hand_space(runtime, hand)?;
            let location = runtime.locate_space(space, base, time).logged()?;
            self.hand_locations[i] = location;
            self.hand_active[i] = location.position_valid;
        }

        self.preferred_hand =
            select_preferred_hand(self.preferred_hand, self.hand_active, self.trigger);
        log::trace!(
            "[input] left {} right {} preferred {:?}",
            self.hand_active[0],
            self.hand_active[1],
            self.preferred_hand
        );
        Ok(())
    }

    pub fn has_button_changes(&self) -> bool {
        let single = [
            self.a_button,
            self.b_button,
            self.x_button,
            self.y_button,
            self.menu,
        ];
        single.iter().any(|state| state.changed_since_last_sync)
            || (0..2).any(|i| {
                self.thumbstick_click[i].changed_since_last_sync
                    || self.thumbrest_touch[i].changed_since_last_sync
                    || self.trigger[i].changed_since_last_sync
                    || self.squeeze[i].changed_since_last_sync
            })
    }

    /// True on the sync where the menu button went down.
    pub fn exit_requested(&self) -> bool {
        self.menu.just_pressed()
    }

    pub fn hand_pose(&self, hand: Hand) -> Option<Posef> {
        let i = hand.index();
        self.hand_active[i].then_some(self.hand_locations[i].pose)
    }
}

/// One active hand wins. With both active, the hand whose trigger went down this sync wins,
/// left first. Otherwise the previous choice sticks.
pub fn select_preferred_hand(
    previous: Hand,
    active: [bool; 2],
    trigger: [ButtonState; 2],
) -> Hand {
    match active {
        [true, false] => Hand::Left,
        [false, true] => Hand::Right,
        [true, true] if trigger[0].just_pressed() => Hand::Left,
        [true, true] if trigger[1].just_pressed() => Hand::Right,
        _ => previous,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vr::runtime::ReferenceSpaceType;
    use crate::vr::simulated::{ERROR_VALIDATION_FAILURE, SimulatedRuntime};
    use crate::vr::{Vector3f, XrError};

    fn pressed_now() -> ButtonState {
        ButtonState {
            current: true,
            changed_since_last_sync: true,
            is_active: true,
        }
    }

    fn held() -> ButtonState {
        ButtonState {
            current: true,
            changed_since_last_sync: false,
            is_active: true,
        }
    }

    fn headless() -> (SimulatedRuntime, SimulatedRuntime) {
        let mut runtime = SimulatedRuntime::default();
        runtime.start_headless_session().expect("session");
        (runtime.clone(), runtime)
    }

    #[test]
    fn single_active_hand_is_preferred() {
        let idle = [ButtonState::default(); 2];
        assert_eq!(
            select_preferred_hand(Hand::Right, [true, false], idle),
            Hand::Left
        );
        assert_eq!(
            select_preferred_hand(Hand::Left, [false, true], idle),
            Hand::Right
        );
    }

    #[test]
    fn fresh_trigger_press_breaks_tie() {
        assert_eq!(
            select_preferred_hand(Hand::Left, [true, true], [held(), pressed_now()]),
            Hand::Right
        );
        assert_eq!(
            select_preferred_hand(Hand::Right, [true, true], [pressed_now(), pressed_now()]),
            Hand::Left
        );
        assert_eq!(
            select_preferred_hand(Hand::Left, [true, true], [held(), held()]),
            Hand::Left
        );
    }

    #[test]
    fn no_active_hand_keeps_previous() {
        let idle = [ButtonState::default(); 2];
        assert_eq!(
            select_preferred_hand(Hand::Left, [false, false], idle),
            Hand::Left
        );
        assert_eq!(InputStateFrame::default().preferred_hand, Hand::Right);
    }

    #[test]
    fn binding_table_rejects_overflow() {
        let (_probe, mut runtime) = headless();
        let set = runtime.create_action_set("set", "Set", 0).expect("set");
        let action = runtime
            .create_action(set, "menu", "Menu", ActionType::Boolean, &[])
            .expect("action");

        let mut table = BindingTable::new();
        for _ in 0..MAX_BINDINGS {
            table
                .add(&mut runtime, action, "/user/hand/left/input/menu/click")
                .expect("within capacity");
        }
        let err = table
            .add(&mut runtime, action, "/user/hand/left/input/menu/click")
            .unwrap_err();
        assert!(matches!(
            err,
            XrError::Input(InputError::BindingOverflow { capacity: MAX_BINDINGS, .. })
        ));
        assert_eq!(table.len(), MAX_BINDINGS);
    }

    #[test]
    fn suggests_touch_controller_bindings() {
        let (probe, mut runtime) = headless();
        let input = InputStateStatic::create(&mut runtime).expect("input");

        let bindings = probe.suggested_bindings();
        assert_eq!(bindings.len(), 17);
        assert!(bindings.contains(&(
            "menu".to_string(),
            "/user/hand/left/input/menu/click".to_string()
        )));
        assert!(bindings.contains(&(
            "squeeze".to_string(),
            "/user/hand/right/input/squeeze/value".to_string()
        )));
        assert!(probe.is_attached());
        assert!(input.action_set().is_some());
    }

    #[test]
    fn rejected_suggestion_is_not_fatal() {
        let (probe, mut runtime) = headless();
        probe.fail_call("xrSuggestInteractionProfileBindings", ERROR_VALIDATION_FAILURE);

        InputStateStatic::create(&mut runtime).expect("input survives rejected bindings");
        assert!(probe.is_attached());
    }

    #[test]
    fn attach_failure_cleans_up() {
        let (probe, mut runtime) = headless();
        probe.fail_call("xrAttachSessionActionSets", ERROR_VALIDATION_FAILURE);

        InputStateStatic::create(&mut runtime).unwrap_err();
        assert_eq!(probe.call_count("xrDestroyActionSet"), 1);
    }

    #[test]
    fn menu_press_requests_exit_once() {
        let (probe, mut runtime) = headless();
        let input = InputStateStatic::create(&mut runtime).expect("input");
        let mut frame = InputStateFrame::default();

        probe.set_boolean("menu", None, true);
        frame
            .sync_buttons_and_thumbsticks(&mut runtime, &input)
            .expect("sync");
        assert!(frame.exit_requested());
        assert!(frame.has_button_changes());

        frame
            .sync_buttons_and_thumbsticks(&mut runtime, &input)
            .expect("sync");
        assert!(!frame.exit_requested());
        assert!(!frame.has_button_changes());
    }

    #[test]
    fn per_hand_values_use_subaction_paths() {
        let (probe, mut runtime) = headless();
        let input = InputStateStatic::create(&mut runtime).expect("input");
        let mut frame = InputStateFrame::default();

        probe.set_boolean("trigger", Some(RIGHT_HAND_PATH), true);
        probe.set_vector2("thumbstick", Some(LEFT_HAND_PATH), Vector2f::new(0.5, -1.0));
        frame
            .sync_buttons_and_thumbsticks(&mut runtime, &input)
            .expect("sync");

        assert!(frame.trigger[Hand::Right.index()].just_pressed());
        assert!(!frame.trigger[Hand::Left.index()].current);
        assert_eq!(
            frame.thumbstick[Hand::Left.index()].current,
            Vector2f::new(0.5, -1.0)
        );
    }

    #[test]
    fn hand_spaces_are_created_lazily_once() {
        let (probe, mut runtime) = headless();
        let local = runtime
            .create_reference_space(ReferenceSpaceType::Local, Posef::IDENTITY)
            .expect("local");
        let mut input = InputStateStatic::create(&mut runtime).expect("input");
        let mut frame = InputStateFrame::default();
        probe.set_hand_active(RIGHT_HAND_PATH, false);
        probe.set_hand_pose(
            LEFT_HAND_PATH,
            Posef::new(Default::default(), Vector3f::new(-0.2, 1.2, -0.4)),
        );

        for _ in 0..3 {
            frame
                .sync_buttons_and_thumbsticks(&mut runtime, &input)
                .expect("sync");
            frame
                .sync_hand_poses(&mut runtime, &mut input, local, Time::from_nanos(1))
                .expect("poses");
        }

        assert_eq!(probe.call_count("xrCreateActionSpace"), 1);
        assert!(input.hand_space(Hand::Left).is_some());
        assert!(input.hand_space(Hand::Right).is_none());
        assert_eq!(frame.preferred_hand, Hand::Left);
        let pose = frame.hand_pose(Hand::Left).expect("left pose");
        assert!((pose.position.x + 0.2).abs() < 1e-5);
        assert!(frame.hand_pose(Hand::Right).is_none());

        input.destroy(&mut runtime);
        input.destroy(&mut runtime);
        assert_eq!(probe.call_count("xrDestroyActionSet"), 1);
        assert_eq!(probe.live_spaces(), 1);
    }
}
