// ===============================
// src/translate.rs
// ===============================
//
// Maps Ledger error codes to what an operator sees (user message + hint)
// and what the logs get (debug message with code, text, data and meta).
//
use ahash::AHashMap as HashMap;
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::error::{LedgerError, CODE_LAYER_NOT_CONFIGURED, CODE_MALFORMED, CODE_SERIALIZE, CODE_SIGNING};
use crate::metrics::TRANSLATED_ERRORS;
use crate::rpc::UpstreamError;

/// "Idempotent request with this ext_key is already being processed".
pub const CODE_IDEMPOTENT_IN_PROCESS: i64 = 4909;

static MESSAGES: Lazy<HashMap<i64, &'static str>> = Lazy::new(|| {
    HashMap::from_iter([
        // transport class
        (400, "Некорректный запрос к банку"),
        (401, "Ошибка аутентификации в API банка"),
        (403, "Доступ запрещён: проверьте подпись, сертификат и IP-адрес"),
        (422, "Данные сделки не прошли проверку"),
        (500, "Внутренняя ошибка на стороне банка"),
        (502, "API банка недоступно"),
        (503, "API банка временно недоступно"),
        (504, "API банка не ответило вовремя"),
        // business codes
        (4409, "Бенефициар не найден"),
        (4410, "Бенефициар не активен"),
        (4411, "Виртуальный счёт не найден"),
        (4412, "Платёж не найден"),
        (4413, "Сумма платежа не совпадает с ожидаемой"),
        (4414, "Платёж уже идентифицирован"),
        (4415, "Недостаточно средств на виртуальном счёте"),
        (4417, "Сделка не найдена"),
        (4418, "Недопустимая смена статуса сделки"),
        (4422, "Ошибка при возврате платежа"),
        (4436, "Сделка не прошла проверку комплаенса"),
        (4558, "На счёт наложены ограничения"),
        (CODE_IDEMPOTENT_IN_PROCESS, "Запрос с этим ключом уже обрабатывается"),
        // local faults
        (CODE_SIGNING, "Не удалось подписать запрос: проверьте ключ"),
        (CODE_SERIALIZE, "Не удалось сформировать запрос"),
        (CODE_MALFORMED, "Банк вернул некорректный ответ"),
        (CODE_LAYER_NOT_CONFIGURED, "Для выбранного контура не настроены ключи"),
    ])
});

static HINTS: Lazy<HashMap<i64, &'static str>> = Lazy::new(|| {
    HashMap::from_iter([
        (403, "Проверьте отпечаток сертификата и что IP-адрес сервера добавлен в белый список"),
        (500, "Повторите попытку позже"),
        (502, "Повторите попытку позже"),
        (503, "Повторите попытку позже"),
        (504, "Повторите попытку позже; если ошибка повторяется, проверьте доступ к API"),
        (4409, "Обновите список бенефициаров"),
        (4410, "Активируйте бенефициара и повторите операцию"),
        (4411, "Обновите список виртуальных счетов"),
        (4412, "Обновите список платежей"),
        (4414, "Обновите список платежей"),
        (4415, "Пополните виртуальный счёт"),
        (4417, "Обновите список сделок"),
        (4418, "Обновите сделку и проверьте её текущий статус"),
        (4558, "Обратитесь в поддержку банка"),
        (CODE_IDEMPOTENT_IN_PROCESS, "Дождитесь завершения обработки и обновите данные"),
    ])
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslatedError {
    pub code: i64,
    pub user_message: String,
    pub debug_message: String,
    pub hint: Option<String>,
    pub is_retryable: bool,
    pub is_idempotent_in_process: bool,
}

pub fn translate(err: &UpstreamError) -> TranslatedError {
    let user_message = MESSAGES
        .get(&err.code)
        .map(|m| m.to_string())
        .unwrap_or_else(|| err.message.clone());

    let mut debug_message = format!("[{}] {}", err.code, err.message);
    if let Some(data) = &err.data {
        debug_message.push_str(&format!(" data={data}"));
    }
    if let Some(meta) = &err.meta {
        debug_message.push_str(&format!(" meta={meta}"));
    }

    TRANSLATED_ERRORS.with_label_values(&[&err.code.to_string()]).inc();

    TranslatedError {
        code: err.code,
        user_message,
        debug_message,
        hint: HINTS.get(&err.code).map(|h| h.to_string()),
        is_retryable: is_retryable(err.code),
        is_idempotent_in_process: err.code == CODE_IDEMPOTENT_IN_PROCESS,
    }
}

/// Transport, signing and validation faults take the same path.
pub fn translate_fault(err: &LedgerError) -> TranslatedError {
    translate(&err.to_upstream())
}

/// Server-error class only; 4-digit business codes never retry.
pub fn is_retryable(code: i64) -> bool {
    (500..600).contains(&code)
}
