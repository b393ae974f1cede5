// Copyright 2025 Strata Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Application entry point
//!
//! The host constructs an [`App`], registers types and plugins, declares
//! tags and systems, and calls [`App::run`]. Startup systems dispatch once;
//! main systems dispatch every tick until a system raises [`ShouldQuit`].

use std::time::Instant;

use rustc_hash::FxHashSet;

use crate::component::Component;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::system::{Condition, System, SystemAccess, SystemContext};
use crate::world::World;

/// Seconds since the last iteration of the main loop started. Zero on the
/// first tick.
pub struct DeltaTime {
    pub seconds: f32,
}

/// Flag the main loop checks after every tick. Initially true; [`App::run`]
/// clears it before looping.
pub struct ShouldQuit {
    pub value: bool,
}

/// Process argument list handed to the app at construction.
pub struct Arguments {
    pub args: Vec<String>,
}

/// A plugin is a plain function that further configures the app. Adding the
/// same function twice is a warned no-op.
pub type Plugin = fn(&mut App);

/// Ties the world and the two dispatchers together.
pub struct App {
    world: World,
    startup: Dispatcher,
    main: Dispatcher,
    plugins: FxHashSet<usize>,
    started: bool,
    last_tick: Option<Instant>,
}

impl App {
    pub fn new() -> Self {
        Self::with_args(Vec::new())
    }

    pub fn with_args(args: Vec<String>) -> Self {
        let mut world = World::new();
        world.insert_resource(DeltaTime { seconds: 0.0 });
        world.insert_resource(ShouldQuit { value: true });
        world.insert_resource(Arguments { args });
        Self {
            world,
            startup: Dispatcher::new(),
            main: Dispatcher::new(),
            plugins: FxHashSet::default(),
            started: false,
            last_tick: None,
        }
    }

    /// Add a plugin; it runs immediately against this app.
    pub fn add_plugin(&mut self, plugin: Plugin) -> &mut Self {
        if !self.plugins.insert(plugin as usize) {
            tracing::warn!("plugin added twice, ignoring");
            return self;
        }
        plugin(self);
        self
    }

    pub fn add_component<T: Component>(&mut self) -> &mut Self {
        self.world.register_component::<T>();
        self
    }

    /// Register a directed relation type.
    pub fn add_relation<T: Component>(&mut self) -> &mut Self {
        self.world.register_relation::<T>(false, false);
        self
    }

    /// Register a relation where `(a, b)` and `(b, a)` are the same instance.
    pub fn add_symmetric_relation<T: Component>(&mut self) -> &mut Self {
        self.world.register_relation::<T>(true, false);
        self
    }

    /// Register a relation restricted to a forest: one parent per entity, no
    /// cycles.
    pub fn add_tree_relation<T: Component>(&mut self) -> &mut Self {
        self.world.register_relation::<T>(false, true);
        self
    }

    pub fn add_resource<R: Component>(&mut self, value: R) -> &mut Self {
        self.world.insert_resource(value);
        self
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    /// Configure a tag of the main dispatcher.
    pub fn tag(&mut self, name: &str) -> TagBuilder<'_> {
        self.main.add_tag(name);
        TagBuilder {
            dispatcher: &mut self.main,
        }
    }

    /// Configure a tag of the startup dispatcher.
    pub fn startup_tag(&mut self, name: &str) -> TagBuilder<'_> {
        self.startup.add_tag(name);
        TagBuilder {
            dispatcher: &mut self.startup,
        }
    }

    /// Declare a system of the main dispatcher.
    pub fn system(&mut self, name: &str) -> SystemConfig<'_> {
        SystemConfig::new(self, false, name)
    }

    /// Declare a system dispatched once at startup.
    pub fn startup_system(&mut self, name: &str) -> SystemConfig<'_> {
        SystemConfig::new(self, true, name)
    }

    /// Run one main tick, dispatching startup systems first if they have not
    /// run yet.
    pub fn update(&mut self) -> Result<()> {
        if !self.started {
            self.started = true;
            self.startup.run(&mut self.world)?;
        }

        let now = Instant::now();
        let delta = self
            .last_tick
            .map(|last| now.duration_since(last).as_secs_f32())
            .unwrap_or(0.0);
        self.last_tick = Some(now);
        if let Some(time) = self.world.resource_mut::<DeltaTime>() {
            time.seconds = delta;
        }

        self.main.run(&mut self.world)
    }

    /// Dispatch startup systems, then loop until [`ShouldQuit`] is raised.
    pub fn run(&mut self) -> Result<()> {
        if let Some(quit) = self.world.resource_mut::<ShouldQuit>() {
            quit.value = false;
        }
        loop {
            self.update()?;
            if self
                .world
                .resource::<ShouldQuit>()
                .map_or(true, |quit| quit.value)
            {
                return Ok(());
            }
        }
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

/// Chained configuration of a tag.
pub struct TagBuilder<'a> {
    dispatcher: &'a mut Dispatcher,
}

impl TagBuilder<'_> {
    /// Members of this tag run before members of the given tag.
    pub fn before(self, tag: &str) -> Self {
        self.dispatcher.tag_before(tag);
        self
    }

    /// Members of this tag run after members of the given tag.
    pub fn after(self, tag: &str) -> Self {
        self.dispatcher.tag_after(tag);
        self
    }

    /// Copy another tag's settings into this one at compile time.
    pub fn inherits(self, tag: &str) -> Self {
        self.dispatcher.tag_inherit(tag);
        self
    }

    /// Members only run when the condition holds.
    pub fn run_if<F>(self, condition: F) -> Self
    where
        F: FnMut(&mut SystemContext) -> bool + Send + 'static,
    {
        self.dispatcher.tag_condition(Condition::new("tag condition", condition));
        self
    }

    /// Members re-run as long as the condition holds on re-entry.
    pub fn repeat_while<F>(self, condition: F) -> Self
    where
        F: FnMut(&mut SystemContext) -> bool + Send + 'static,
    {
        self.dispatcher.tag_repeat();
        self.dispatcher.tag_condition(Condition::new("repeat condition", condition));
        self
    }

    /// Nest this repeat group inside another repeating tag.
    pub fn sub_group_of(self, parent: &str) -> Self {
        self.dispatcher.tag_sub_group_of(parent);
        self
    }
}

/// Chained configuration of a system, finished by [`SystemConfig::call`].
pub struct SystemConfig<'a> {
    app: &'a mut App,
    startup: bool,
    name: String,
    access: SystemAccess,
    tagged: Vec<String>,
    before: Vec<String>,
    after: Vec<String>,
    condition: Option<Condition>,
}

impl<'a> SystemConfig<'a> {
    fn new(app: &'a mut App, startup: bool, name: &str) -> Self {
        Self {
            app,
            startup,
            name: name.to_string(),
            access: SystemAccess::empty(),
            tagged: Vec::new(),
            before: Vec::new(),
            after: Vec::new(),
            condition: None,
        }
    }

    /// Add the system to a tag; a repeating tag makes it a member of that
    /// repeat group.
    pub fn tagged(mut self, tag: &str) -> Self {
        self.tagged.push(tag.to_string());
        self
    }

    /// Run before every member of the tag.
    pub fn before(mut self, tag: &str) -> Self {
        self.before.push(tag.to_string());
        self
    }

    /// Run after every member of the tag.
    pub fn after(mut self, tag: &str) -> Self {
        self.after.push(tag.to_string());
        self
    }

    /// Only run when the condition holds this tick.
    pub fn only_if<F>(mut self, condition: F) -> Self
    where
        F: FnMut(&mut SystemContext) -> bool + Send + 'static,
    {
        self.condition = Some(Condition::new("system condition", condition));
        self
    }

    /// Declare a read of a registered type.
    pub fn reads<T: Component>(mut self) -> Self {
        let ty = self.app.world.types().id_of::<T>();
        if !self.access.reads.contains(&ty) {
            self.access.reads.push(ty);
        }
        self
    }

    /// Declare a write of a registered type.
    pub fn writes<T: Component>(mut self) -> Self {
        let ty = self.app.world.types().id_of::<T>();
        if !self.access.writes.contains(&ty) {
            self.access.writes.push(ty);
        }
        self
    }

    /// Declare that the system records commands.
    pub fn with_commands(mut self) -> Self {
        self.access.commands = true;
        self
    }

    /// Finish with the system body.
    pub fn call<F>(self, body: F)
    where
        F: FnMut(&mut SystemContext) -> Result<()> + Send + 'static,
    {
        let dispatcher = if self.startup {
            &mut self.app.startup
        } else {
            &mut self.app.main
        };
        dispatcher.add_system(System::new(self.name, self.access, body));
        for tag in &self.tagged {
            dispatcher.system_tag(tag);
        }
        for tag in &self.before {
            dispatcher.system_before(tag);
        }
        for tag in &self.after {
            dispatcher.system_after(tag);
        }
        if let Some(condition) = self.condition {
            dispatcher.system_condition(condition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Trace = Arc<Mutex<Vec<&'static str>>>;

    #[test]
    fn test_startup_runs_once() {
        let trace: Trace = Arc::default();
        let mut app = App::new();

        let inner = Arc::clone(&trace);
        app.startup_system("init").call(move |_| {
            inner.lock().unwrap().push("init");
            Ok(())
        });
        let inner = Arc::clone(&trace);
        app.system("tick").call(move |_| {
            inner.lock().unwrap().push("tick");
            Ok(())
        });

        app.update().unwrap();
        app.update().unwrap();
        assert_eq!(*trace.lock().unwrap(), vec!["init", "tick", "tick"]);
    }

    #[test]
    fn test_run_loops_until_should_quit() {
        let mut app = App::new();
        app.add_resource(0u32);

        app.system("count up").call(|ctx| {
            let ticks = ctx.resource_mut::<u32>().unwrap();
            *ticks += 1;
            let done = *ticks == 3;
            if done {
                ctx.resource_mut::<ShouldQuit>().unwrap().value = true;
            }
            Ok(())
        });

        app.run().unwrap();
        assert_eq!(app.world().resource::<u32>(), Some(&3));
    }

    #[test]
    fn test_delta_time_and_arguments() {
        let mut app = App::with_args(vec!["--fast".to_string()]);
        app.update().unwrap();

        let delta = app.world().resource::<DeltaTime>().unwrap();
        assert!(delta.seconds >= 0.0);
        let args = app.world().resource::<Arguments>().unwrap();
        assert_eq!(args.args, vec!["--fast".to_string()]);
    }

    #[test]
    fn test_plugin_added_once() {
        static COUNTER: Mutex<u32> = Mutex::new(0);

        fn plugin(_app: &mut App) {
            *COUNTER.lock().unwrap() += 1;
        }

        let mut app = App::new();
        app.add_plugin(plugin);
        app.add_plugin(plugin);
        assert_eq!(*COUNTER.lock().unwrap(), 1);
    }

    #[test]
    fn test_systems_record_commands() {
        #[derive(Debug, PartialEq)]
        struct Block(u8);

        let mut app = App::new();
        app.add_component::<Block>();

        app.system("emit")
            .with_commands()
            .call(|ctx| {
                ctx.commands().create((Block(1),));
                Ok(())
            });

        app.update().unwrap();
        assert_eq!(app.world().entity_count(), 1);
    }
}
