pub mod api;
pub mod auth;
pub mod config;
pub mod dashboard;
pub mod geo;
pub mod geolocation;
pub mod map;
pub mod proximity;
pub mod publisher;
pub mod session;
pub mod store;
pub mod structs;
pub mod subscriber;
pub mod toast;

use config::Config;
use geolocation::Position;
use session::*;
use structs::*;

use dptree::{case, deps};
use std::error::Error;
use teloxide::{
    dispatching::{dialogue, dialogue::InMemStorage},
    dptree::endpoint,
    filter_command,
    payloads::SendMessageSetters,
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, InputFile, KeyboardRemove, ParseMode::Html},
    utils::{command::BotCommands, html},
};

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;
type MyDialogue = Dialogue<State, InMemStorage<State>>;

#[derive(BotCommands, Clone)]
#[command(
    rename_rule = "lowercase",
    description = "These commands are supported:"
)]
enum Command {
    #[command(description = "Display help menu showing the commands list")]
    Help,
    #[command(description = "Log in as a bus driver.")]
    Driver,
    #[command(description = "Follow a bus and get alerts for your stop.")]
    Student,
    #[command(description = "Start or stop sharing your bus location.")]
    Track,
    #[command(description = "Edit your bus information.")]
    Profile,
    #[command(description = "Show tracking status and ETAs.")]
    Status,
    #[command(description = "Send the current map as a GeoJSON file.")]
    Map,
    #[command(description = "Log out of the driver account.")]
    Logout,
    #[command(description = "Cancel the current step.")]
    Cancel,
}

#[derive(Clone, Default)]
enum State {
    #[default]
    Start,
    ReceiveEmail,
    ReceivePassword {
        email: String,
    },
    ReceiveBusNumber,
    ReceiveBusName {
        number: String,
    },
    ReceiveDriverName {
        number: String,
        name: String,
    },
    ReceiveRouteName {
        number: String,
        name: String,
        driver: String,
    },
    ReceiveBus,
    ReceiveStop,
    Following,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv::dotenv().ok();
    pretty_env_logger::init();
    log::info!("Starting 'Campus bus' BOT ...");

    let config = Config::from_env()?;
    let bot = Bot::from_env();
    bot.set_my_commands(Command::bot_commands()).await?;

    let command_handler = filter_command::<Command, _>()
        .branch(case![Command::Help].endpoint(help))
        .branch(case![Command::Driver].endpoint(driver))
        .branch(case![Command::Student].endpoint(student))
        .branch(case![Command::Track].endpoint(track))
        .branch(case![Command::Profile].endpoint(profile))
        .branch(case![Command::Status].endpoint(status))
        .branch(case![Command::Map].endpoint(send_map))
        .branch(case![Command::Logout].endpoint(logout))
        .branch(case![Command::Cancel].endpoint(cancel));

    let message_handler = Update::filter_message()
        .branch(command_handler)
        .branch(dptree::filter(|msg: Message| msg.location().is_some()).endpoint(receive_location))
        .branch(case![State::ReceiveEmail].endpoint(receive_email))
        .branch(case![State::ReceivePassword { email }].endpoint(receive_password))
        .branch(case![State::ReceiveBusNumber].endpoint(receive_bus_number))
        .branch(case![State::ReceiveBusName { number }].endpoint(receive_bus_name))
        .branch(case![State::ReceiveDriverName { number, name }].endpoint(receive_driver_name))
        .branch(
            case![State::ReceiveRouteName {
                number,
                name,
                driver
            }]
            .endpoint(receive_route_name),
        )
        .branch(endpoint(invalid_state));

    let callback_query_handler = Update::filter_callback_query()
        .branch(case![State::ReceiveBus].endpoint(receive_bus))
        .branch(case![State::ReceiveStop].endpoint(receive_stop))
        .branch(case![State::Following].endpoint(receive_following));

    let dial = dialogue::enter::<Update, InMemStorage<State>, State, _>()
        .branch(message_handler)
        .branch(callback_query_handler);

    // Live location updates arrive as edits of the first location message.
    let handler = dptree::entry()
        .branch(Update::filter_edited_message().endpoint(receive_location))
        .branch(dial);

    let sessions = Sessions::new(bot.clone(), config);

    Dispatcher::builder(bot, handler)
        .dependencies(deps![InMemStorage::<State>::new(), sessions])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
    Ok(())
}

async fn help(bot: Bot, msg: Message) -> HandlerResult {
    bot.send_message(msg.chat.id, Command::descriptions().to_string())
        .await?;
    Ok(())
}

async fn invalid_state(bot: Bot, msg: Message) -> HandlerResult {
    bot.send_message(
        msg.chat.id,
        "Unable to handle the message. Type /help to see the usage.",
    )
    .await?;
    Ok(())
}

async fn cancel(bot: Bot, dialogue: MyDialogue, msg: Message, sessions: Sessions) -> HandlerResult {
    sessions.close_student(msg.chat.id).await;
    bot.send_message(msg.chat.id, "🚫 Cancelled!").await?;
    dialogue.exit().await?;
    Ok(())
}

async fn status(bot: Bot, msg: Message, sessions: Sessions) -> HandlerResult {
    let mut sections = vec![];
    if let Some(handle) = sessions.find_driver(msg.chat.id) {
        sections.extend(handle.request(DriverCommand::Status).await);
    }
    if let Some(handle) = sessions.find_student(msg.chat.id) {
        sections.extend(handle.request(StudentCommand::Summary).await);
    }
    if sections.is_empty() {
        sections.push("Nothing to report yet. Start with /driver or /student.".to_string());
    }

    bot.send_message(msg.chat.id, html::escape(&sections.join("\n\n")))
        .parse_mode(Html)
        .await?;
    Ok(())
}

async fn send_map(bot: Bot, msg: Message, sessions: Sessions) -> HandlerResult {
    let scene = match (sessions.find_student(msg.chat.id), sessions.find_driver(msg.chat.id)) {
        (Some(handle), _) => handle.request(StudentCommand::Map).await.flatten(),
        (None, Some(handle)) => handle.request(DriverCommand::Map).await.flatten(),
        (None, None) => None,
    };
    let Some(scene) = scene else {
        bot.send_message(msg.chat.id, "🗺 No map yet. Start with /driver or /student.")
            .await?;
        return Ok(());
    };

    let document = InputFile::memory(serde_json::to_vec_pretty(&scene)?).file_name("bus-map.geojson");
    bot.send_document(msg.chat.id, document)
        .caption(format!("🗺 {} map features", scene.features.len()))
        .await?;
    Ok(())
}

//////////////////////////////////////////////////////////
// Driver handlers
//////////////////////////////////////////////////////////
async fn driver(bot: Bot, dialogue: MyDialogue, msg: Message, sessions: Sessions) -> HandlerResult {
    let handle = sessions.driver(msg.chat.id).await;
    if let Some(Some(_)) = handle.request(DriverCommand::Profile).await {
        let status = handle.request(DriverCommand::Status).await.unwrap_or_default();
        bot.send_message(msg.chat.id, format!("You are already logged in.\n\n{status}"))
            .await?;
        return Ok(());
    }

    bot.send_message(
        msg.chat.id,
        "🚌 Driver login\n\nWhat is your <b>email</b>?",
    )
    .parse_mode(Html)
    .reply_markup(KeyboardRemove::new())
    .await?;
    dialogue.update(State::ReceiveEmail).await?;
    Ok(())
}

async fn receive_email(bot: Bot, dialogue: MyDialogue, msg: Message) -> HandlerResult {
    match msg.text().map(ToOwned::to_owned) {
        Some(email) => {
            bot.send_message(msg.chat.id, "🔑 Now send me your <b>password</b>.")
                .parse_mode(Html)
                .await?;
            dialogue.update(State::ReceivePassword { email }).await?;
        }
        None => {
            bot.send_message(msg.chat.id, "❌ Please, send me your email address.")
                .await?;
        }
    }
    Ok(())
}

async fn receive_password(
    bot: Bot,
    dialogue: MyDialogue,
    msg: Message,
    email: String,
    sessions: Sessions,
) -> HandlerResult {
    let Some(password) = msg.text().map(ToOwned::to_owned) else {
        bot.send_message(msg.chat.id, "❌ Please, send me your password.")
            .await?;
        return Ok(());
    };
    // Keep the password out of the chat history
    if let Err(e) = bot.delete_message(msg.chat.id, msg.id).await {
        log::warn!("Could not delete password message: {e}");
    }

    let handle = sessions.driver(msg.chat.id).await;
    let logged_in = handle
        .request(|reply| DriverCommand::Login {
            email,
            password,
            reply,
        })
        .await
        .unwrap_or(false);

    if logged_in {
        bot.send_message(
            msg.chat.id,
            "Use /profile to set up your bus, then share your <b>live location</b> here and \
             press /track to start broadcasting.",
        )
        .parse_mode(Html)
        .await?;
        dialogue.exit().await?;
    } else {
        bot.send_message(msg.chat.id, "Send your email again, or /cancel.")
            .await?;
        dialogue.update(State::ReceiveEmail).await?;
    }
    Ok(())
}

async fn logout(bot: Bot, dialogue: MyDialogue, msg: Message, sessions: Sessions) -> HandlerResult {
    match sessions.find_driver(msg.chat.id) {
        Some(handle) => {
            handle.request(DriverCommand::Logout).await;
            drop(handle);
            sessions.close_driver(msg.chat.id).await;
        }
        None => {
            bot.send_message(msg.chat.id, "You are not logged in.").await?;
        }
    }
    dialogue.exit().await?;
    Ok(())
}

async fn track(bot: Bot, msg: Message, sessions: Sessions) -> HandlerResult {
    let Some(handle) = sessions.find_driver(msg.chat.id) else {
        bot.send_message(msg.chat.id, "Log in first with /driver.").await?;
        return Ok(());
    };
    if handle.request(DriverCommand::ToggleTracking).await == Some(true) {
        bot.send_message(
            msg.chat.id,
            "📍 Keep sharing your <b>live location</b> with this chat. Send /track again to stop.",
        )
        .parse_mode(Html)
        .await?;
    }
    Ok(())
}

async fn profile(bot: Bot, dialogue: MyDialogue, msg: Message, sessions: Sessions) -> HandlerResult {
    let current = match sessions.find_driver(msg.chat.id) {
        Some(handle) => handle.request(DriverCommand::Profile).await.flatten(),
        None => None,
    };
    let Some(current) = current else {
        bot.send_message(msg.chat.id, "Log in first with /driver.").await?;
        return Ok(());
    };

    let mut text = String::from("📝 Bus information\n\n");
    if !current.number.is_empty() {
        text.push_str(&format!(
            "Current: <b>{}</b> ({}), driver {}, route {}\n\n",
            html::escape(&current.name),
            html::escape(&current.number),
            html::escape(&current.driver),
            html::escape(&current.route)
        ));
    }
    text.push_str("What is the <b>bus number</b>?");
    bot.send_message(msg.chat.id, text).parse_mode(Html).await?;
    dialogue.update(State::ReceiveBusNumber).await?;
    Ok(())
}

async fn receive_bus_number(bot: Bot, dialogue: MyDialogue, msg: Message) -> HandlerResult {
    match msg.text().map(ToOwned::to_owned) {
        Some(number) => {
            bot.send_message(msg.chat.id, "What is the <b>bus name</b>?")
                .parse_mode(Html)
                .await?;
            dialogue.update(State::ReceiveBusName { number }).await?;
        }
        None => {
            bot.send_message(msg.chat.id, "❌ Please, send me the bus number.")
                .await?;
        }
    }
    Ok(())
}

async fn receive_bus_name(
    bot: Bot,
    dialogue: MyDialogue,
    msg: Message,
    number: String,
) -> HandlerResult {
    match msg.text().map(ToOwned::to_owned) {
        Some(name) => {
            bot.send_message(msg.chat.id, "What is the <b>driver name</b>?")
                .parse_mode(Html)
                .await?;
            dialogue
                .update(State::ReceiveDriverName { number, name })
                .await?;
        }
        None => {
            bot.send_message(msg.chat.id, "❌ Please, send me the bus name.")
                .await?;
        }
    }
    Ok(())
}

async fn receive_driver_name(
    bot: Bot,
    dialogue: MyDialogue,
    msg: Message,
    (number, name): (String, String),
) -> HandlerResult {
    match msg.text().map(ToOwned::to_owned) {
        Some(driver) => {
            bot.send_message(msg.chat.id, "And the <b>route name</b>?")
                .parse_mode(Html)
                .await?;
            dialogue
                .update(State::ReceiveRouteName {
                    number,
                    name,
                    driver,
                })
                .await?;
        }
        None => {
            bot.send_message(msg.chat.id, "❌ Please, send me the driver name.")
                .await?;
        }
    }
    Ok(())
}

async fn receive_route_name(
    bot: Bot,
    dialogue: MyDialogue,
    msg: Message,
    (number, name, driver): (String, String, String),
    sessions: Sessions,
) -> HandlerResult {
    let Some(route) = msg.text().map(ToOwned::to_owned) else {
        bot.send_message(msg.chat.id, "❌ Please, send me the route name.")
            .await?;
        return Ok(());
    };
    let Some(handle) = sessions.find_driver(msg.chat.id) else {
        bot.send_message(msg.chat.id, "Log in first with /driver.").await?;
        dialogue.exit().await?;
        return Ok(());
    };

    let profile = BusProfile {
        number,
        name,
        driver,
        route,
    };
    handle
        .request(|reply| DriverCommand::SaveProfile { profile, reply })
        .await;
    dialogue.exit().await?;
    Ok(())
}

/// Live-location messages and their edits become geolocation samples.
async fn receive_location(msg: Message, sessions: Sessions) -> HandlerResult {
    let Some(location) = msg.location() else {
        return Ok(());
    };
    let position = Position {
        coords: LatLng::new(location.latitude, location.longitude),
        captured_at: msg.edit_date().copied().unwrap_or(msg.date),
    };
    if !sessions.push_location(msg.chat.id, position) {
        log::debug!("Ignoring location from chat {}: not tracking", msg.chat.id.0);
    }
    Ok(())
}

//////////////////////////////////////////////////////////
// Student handlers
//////////////////////////////////////////////////////////
async fn student(bot: Bot, dialogue: MyDialogue, msg: Message, sessions: Sessions) -> HandlerResult {
    let handle = sessions.student(msg.chat.id).await;
    if send_bus_list(&bot, msg.chat.id, &handle).await? {
        dialogue.update(State::ReceiveBus).await?;
    }
    Ok(())
}

/// Returns false when there is nothing to pick from.
async fn send_bus_list(bot: &Bot, chat_id: ChatId, handle: &StudentHandle) -> Result<bool, teloxide::RequestError> {
    let buses = handle.request(StudentCommand::Buses).await.unwrap_or_default();
    if buses.is_empty() {
        bot.send_message(chat_id, "🚏 No buses are registered yet.").await?;
        return Ok(false);
    }

    let buttons = buses
        .iter()
        .map(|bus| {
            let icon = if bus.is_active() { "🟢" } else { "⚪" };
            (format!("{icon} {}", bus.label()), bus.id.clone())
        })
        .collect();
    bot.send_message(chat_id, "🚌 Select a bus to follow:")
        .reply_markup(make_inline_keyboard(buttons, 1))
        .await?;
    Ok(true)
}

async fn clear_keyboard(bot: &Bot, q: &CallbackQuery) -> Result<(), teloxide::RequestError> {
    bot.answer_callback_query(q.id.clone()).await?;
    if let Some(message) = &q.message {
        bot.edit_message_reply_markup(message.chat.id, message.id)
            .reply_markup(InlineKeyboardMarkup::default())
            .await?;
    }
    Ok(())
}

async fn receive_bus(bot: Bot, dialogue: MyDialogue, q: CallbackQuery, sessions: Sessions) -> HandlerResult {
    let Some(bus_id) = q.data.clone() else {
        return Ok(());
    };
    clear_keyboard(&bot, &q).await?;
    let chat_id = dialogue.chat_id();
    let handle = sessions.student(chat_id).await;

    let selected = handle
        .request(|reply| StudentCommand::SelectBus { bus_id, reply })
        .await
        .flatten();
    let Some(bus) = selected else {
        bot.send_message(chat_id, "❌ That bus is no longer available.").await?;
        send_bus_list(&bot, chat_id, &handle).await?;
        return Ok(());
    };

    let stops: Vec<(String, String)> = bus
        .stops
        .iter()
        .map(|stop| (stop.name.clone(), stop.id.clone()))
        .collect();
    let mut text = format!(
        "🚌 <b>{}</b>\nRoute: {}\n",
        html::escape(&bus.label()),
        html::escape(&bus.route)
    );
    if stops.is_empty() {
        text.push_str("\nThis bus has no stops yet.");
        bot.send_message(chat_id, text).parse_mode(Html).await?;
        dialogue.exit().await?;
        return Ok(());
    }
    text.push_str("\n🚏 Select your stop:");
    bot.send_message(chat_id, text)
        .parse_mode(Html)
        .reply_markup(make_inline_keyboard(stops, 2))
        .await?;
    dialogue.update(State::ReceiveStop).await?;
    Ok(())
}

async fn receive_stop(bot: Bot, dialogue: MyDialogue, q: CallbackQuery, sessions: Sessions) -> HandlerResult {
    let Some(stop_id) = q.data.clone() else {
        return Ok(());
    };
    clear_keyboard(&bot, &q).await?;
    let chat_id = dialogue.chat_id();
    let handle = sessions.student(chat_id).await;

    let selected = handle
        .request(|reply| StudentCommand::SelectStop { stop_id, reply })
        .await
        .flatten();
    if selected.is_none() {
        bot.send_message(chat_id, "❌ That stop is no longer served. Pick a bus with /student.")
            .await?;
        dialogue.exit().await?;
        return Ok(());
    }

    send_following(&bot, chat_id, &handle).await?;
    dialogue.update(State::Following).await?;
    Ok(())
}

async fn send_following(bot: &Bot, chat_id: ChatId, handle: &StudentHandle) -> Result<(), teloxide::RequestError> {
    let summary = handle.request(StudentCommand::Summary).await.unwrap_or_default();
    let kb = make_inline_keyboard(
        vec![
            ("🔔 Toggle alerts".to_string(), "notify".to_string()),
            ("<< Change bus".to_string(), "<<".to_string()),
        ],
        2,
    );
    bot.send_message(chat_id, html::escape(&summary))
        .parse_mode(Html)
        .reply_markup(kb)
        .await?;
    Ok(())
}

async fn receive_following(
    bot: Bot,
    dialogue: MyDialogue,
    q: CallbackQuery,
    sessions: Sessions,
) -> HandlerResult {
    let Some(data) = q.data.clone() else {
        return Ok(());
    };
    clear_keyboard(&bot, &q).await?;
    let chat_id = dialogue.chat_id();
    let handle = sessions.student(chat_id).await;

    if data.starts_with("<<") {
        if send_bus_list(&bot, chat_id, &handle).await? {
            dialogue.update(State::ReceiveBus).await?;
        }
        return Ok(());
    }

    let enabled = handle
        .request(StudentCommand::ToggleNotifications)
        .await
        .unwrap_or(false);
    bot.send_message(
        chat_id,
        if enabled {
            "🔔 Alerts are on. I'll tell you when the bus is within 500 m of your stop."
        } else {
            "🔕 Alerts are off."
        },
    )
    .await?;
    send_following(&bot, chat_id, &handle).await?;
    Ok(())
}

//////////////////////////////////////////////////////////
// Keyboards
//////////////////////////////////////////////////////////
/// Lays `(label, callback data)` buttons out in rows of `chunks`.
fn make_inline_keyboard(list: Vec<(String, String)>, chunks: usize) -> InlineKeyboardMarkup {
    let mut keyboard: Vec<Vec<InlineKeyboardButton>> = vec![];

    for values in list.chunks(chunks) {
        let row = values
            .iter()
            .map(|(label, data)| InlineKeyboardButton::callback(label.to_owned(), data.to_owned()))
            .collect();

        keyboard.push(row);
    }

    InlineKeyboardMarkup::new(keyboard)
}
