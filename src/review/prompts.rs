//! User-facing texts.

pub const APOLOGY: &str =
    "⚠️ Lo siento, ha ocurrido un problema al procesar tu mensaje. Inténtalo de nuevo en unos minutos.";

pub const REVIEW_INTRO: &str = "Empezamos con los perimetros, escribe a continuación en cm las medidas de los siguientes perimetros:";

pub const REVIEW_LAUNCHED: &str = "🔄 Lanzando revisión de seguimiento ahora mismo…";

pub const REVIEW_COMPLETED: &str = "Gracias por completar las preguntas!";

pub const DECLINE_CONFIRMED: &str =
    "✅ Perfecto, no se enviarán fotos. Revisión guardada correctamente.";

pub const PHOTO_STORED: &str = "✅ ¡Imagen recibida y almacenada correctamente!";

pub const PHOTO_MODE_ENABLED: &str = "📸 *Subida manual de fotos activada*\n\n\
Puedes enviar ahora las fotos de la revisión.\n\
Envía las imágenes una a una.\n\n\
Cuando termines, simplemente deja de enviar fotos.";

/// Label of the answer row that references an uploaded image.
pub const IMAGE_ROW_LABEL: &str = "Imagen adjunta";

pub fn welcome(name: &str) -> String {
    format!(
        "¡Hola {name}! 👋\n\n\
         Bienvenido a tu espacio personalizado de seguimiento nutricional. 🥦💪\n\
         Aquí podrás compartir cómo te estás sintiendo, cómo vas con tu plan y recibir recordatorios importantes.\n\n\
         Estoy aquí para acompañarte en cada paso del camino hacia tu mejor versión. ¡Vamos a por ello! 🚀"
    )
}

pub fn review_greeting(name: &str) -> String {
    format!("¡Hola {name}! 👋\n\nComencemos con unas preguntas de seguimiento:")
}

pub fn idle_greeting(name: &str) -> String {
    format!(
        "¡Hola {name}! ¿Qué tal estás? Si tienes alguna duda no dudes en contactar conmigo via Whatsapp o mediante llamada telefónica."
    )
}

pub fn unauthorized(admin_contact: &str) -> String {
    format!("Hable con {admin_contact}, su usuario no está habilitado.")
}

pub fn info(admin_contact: &str) -> String {
    format!(
        "👋 *Bienvenido/a a tu asistente de revisiones nutricionales*\n\n\
         Este bot ha sido diseñado para facilitar el proceso de seguimiento y revisión periódica de tu evolución. \
         A través de preguntas estructuradas, podrás dejar constancia de cómo te encuentras y subir imágenes si lo deseas 📸.\n\n\
         Toda la información que compartes se almacena automáticamente en una base de datos privada, lo que permite llevar un \
         registro detallado de tus progresos a lo largo del tiempo. Gracias a esto, se pueden realizar análisis que nos ayudarán \
         a tomar mejores decisiones y optimizar tu rendimiento 💪📊.\n\n\
         Recuerda que, si tienes cualquier duda o necesitas hablar directamente, puedes contactar con *{admin_contact}* \
         a través de los medios de contacto que te han sido proporcionados.\n\n\
         _Gracias por tu compromiso y dedicación._"
    )
}

pub const INSTRUCTIONS: &str = "ℹ️ *Instrucciones de uso*\n\n\
Este bot forma parte de tu sistema de seguimiento deportivo y nutricional. \
Su objetivo es recopilar, de forma estructurada y continua, la información de cada atleta \
para construir un historial completo de evolución.\n\n\
Gracias a estos datos, es posible realizar análisis y representaciones gráficas que permiten \
evaluar el progreso a lo largo del tiempo y tomar decisiones más precisas para optimizar los resultados.\n\n\
📅 *Frecuencia del seguimiento*\n\
El cuestionario se lanzará automáticamente una vez por semana.\n\
También puede iniciarse manualmente usando la opción correspondiente del bot.\n\n\
📝 *Cómo responder correctamente*\n\
• Responde cada pregunta con un solo mensaje.\n\
• No dividas una respuesta en varios mensajes.\n\
• Espera siempre a que el bot envíe la siguiente pregunta.\n\n\
Este funcionamiento es clave para que la información quede correctamente registrada.\n\n\
Gracias por tu colaboración.";

/// Sheet formula that renders an uploaded image inside its cell.
pub fn image_formula(url: &str, width: u32, height: u32) -> String {
    format!("=IMAGE(\"{url}\"; 4; {height}; {width})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_formula_puts_height_before_width() {
        assert_eq!(
            image_formula("https://drive.google.com/uc?id=abc", 960, 1280),
            "=IMAGE(\"https://drive.google.com/uc?id=abc\"; 4; 1280; 960)"
        );
    }

    #[test]
    fn greetings_include_name() {
        assert!(welcome("Ana").contains("Ana"));
        assert!(review_greeting("Ana").starts_with("¡Hola Ana!"));
        assert!(idle_greeting("Ana").contains("Ana"));
    }
}
